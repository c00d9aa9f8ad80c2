use anyhow::Result;
use java_string::JavaStr;
use pretty_assertions::assert_eq;
use arabica::attribute::{Attribute, KnownAttribute};
use arabica::code::{BytecodeReader, CodeAssembler, Operand};
use arabica::copy::copy_code;
use arabica::pool::{ConstantHandle, ConstantKind, ConstantPool, ConstantResolver, PoolBuilder, RawConstant};
use arabica::version::Version;
use arabica::class_constants::opcode::{ATHROW, LDC, NOP, RETURN};

fn utf8_record(s: &str) -> RawConstant {
	let mut data = (s.len() as u16).to_be_bytes().to_vec();
	data.extend_from_slice(s.as_bytes());
	RawConstant { kind: ConstantKind::Utf8, data: data.into() }
}

fn integer_record(value: i32) -> RawConstant {
	RawConstant { kind: ConstantKind::Integer, data: value.to_be_bytes().to_vec().into() }
}

#[test]
fn copied_ldc_references_the_destination_pool() -> Result<()> {
	// source: Integer 1234 at slot 1
	let source = ConstantPool::from_records(Version::V1_8, [integer_record(1234)]);

	let mut dest = PoolBuilder::new();
	let assembled = copy_code(&source, &mut dest, vec![LDC, 1, RETURN], &[])?;
	let dest = dest.into_pool(Version::V1_8);

	let mut reader = BytecodeReader::new(assembled.code)?;
	let Some(instruction) = reader.try_read_next()? else { panic!("expected an instruction") };
	let Operand::Pool(handle) = instruction.operand else { panic!("expected a pool operand") };

	// the destination's first free slot is 1, and the value survived
	assert_eq!(handle.slot(), 1);
	assert_eq!(dest.get_integer(handle.expecting(ConstantKind::Integer))?, 1234);
	Ok(())
}

#[test]
fn nested_exception_ranges_copy_with_their_offsets_and_order() -> Result<()> {
	let source = ConstantPool::from_records(Version::V1_8, [
		utf8_record("java/lang/Exception"), // 1
		RawConstant { kind: ConstantKind::Class, data: vec![0, 1].into() }, // 2
	]);

	// an outer [0, 6) with a class catch, an inner [2, 4) catch-all,
	// both handled at offset 6
	let mut asm = CodeAssembler::new();
	let outer = asm.begin_exception_block(ConstantHandle::new(2, ConstantKind::Class))?;
	asm.op(NOP)?;
	asm.op(NOP)?;
	let inner = asm.begin_exception_block(ConstantHandle::nil())?;
	asm.op(NOP)?;
	asm.op(NOP)?;
	asm.end_exception_block()?;
	asm.op(NOP)?;
	asm.op(NOP)?;
	asm.end_exception_block()?;
	asm.mark_label(outer)?;
	asm.mark_label(inner)?;
	asm.op(ATHROW)?;
	let original = asm.finish()?;

	let mut dest = PoolBuilder::new();
	let copied = copy_code(&source, &mut dest, original.code.clone(), &original.exceptions)?;
	let dest = dest.into_pool(Version::V1_8);

	assert_eq!(copied.exceptions.len(), 2);

	let first = copied.exceptions[0];
	assert_eq!((first.start, first.end, first.handler), (0, 6, 6));
	assert!(!first.is_catch_all());
	assert_eq!(dest.get_class_name(first.catch_type)?, JavaStr::from_str("java/lang/Exception"));

	let second = copied.exceptions[1];
	assert_eq!((second.start, second.end, second.handler), (2, 4, 6));
	assert!(second.is_catch_all());
	Ok(())
}

/// Shifts every resolved slot up, so one-byte operand forms stop fitting.
struct BigSlotResolver;

impl ConstantResolver for BigSlotResolver {
	fn resolve(&mut self, _source: &ConstantPool, handle: ConstantHandle) -> Result<ConstantHandle> {
		Ok(ConstantHandle::new(handle.slot() + 300, handle.kind()))
	}
}

#[test]
fn growing_slots_re_derive_the_operand_width() -> Result<()> {
	let source = ConstantPool::from_records(Version::V1_8, [integer_record(7)]);

	let before = vec![LDC, 1, RETURN];
	let copied = copy_code(&source, &mut BigSlotResolver, before, &[])?;

	// slot 301 doesn't fit the one-byte form: ldc became ldc_w
	assert_eq!(copied.code, [0x13, 0x01, 0x2d, RETURN]);
	Ok(())
}

#[test]
fn code_attribute_copies_rewrite_nested_line_tables() -> Result<()> {
	let source = ConstantPool::from_records(Version::V1_8, [
		integer_record(7),               // 1
		utf8_record("Code"),             // 2
		utf8_record("LineNumberTable"),  // 3
	]);

	// Code body: ldc #1, return, no handlers, a line table pointing at the return
	let mut body = Vec::new();
	body.extend_from_slice(&[0, 1, 0, 1]); // max_stack, max_locals
	body.extend_from_slice(&3u32.to_be_bytes());
	body.extend_from_slice(&[LDC, 1, RETURN]);
	body.extend_from_slice(&[0, 0]); // no handlers
	body.extend_from_slice(&[0, 1]); // one nested attribute
	body.extend_from_slice(&[0, 3]); // LineNumberTable
	body.extend_from_slice(&6u32.to_be_bytes());
	body.extend_from_slice(&[0, 1, 0, 2, 0, 42]); // one entry: offset 2, line 42

	let attribute = Attribute::new(ConstantHandle::new(2, ConstantKind::Utf8), body);

	let mut dest = PoolBuilder::new();
	let mut sink = Vec::new();
	attribute.copy_to(&source, &mut dest, &mut sink)?;
	let dest = dest.into_pool(Version::V1_8);

	// re-read the copied record against the destination pool
	let name_slot = u16::from_be_bytes([sink[0], sink[1]]);
	let copied = Attribute::new(ConstantHandle::new(name_slot, ConstantKind::Utf8), sink[6..].to_vec());
	assert_eq!(copied.name_string(&dest)?, JavaStr::from_str("Code"));

	let KnownAttribute::Code(code) = copied.decode(&dest)? else {
		panic!("expected a Code attribute");
	};

	// the constant kept its value behind the new slot
	let mut reader = code.instructions()?;
	let Some(instruction) = reader.try_read_next()? else { panic!("expected an instruction") };
	let Operand::Pool(handle) = instruction.operand else { panic!("expected a pool operand") };
	assert_eq!(dest.get_integer(handle.expecting(ConstantKind::Integer))?, 7);

	// the line entry still points at the return instruction
	assert_eq!(code.attributes.len(), 1);
	let KnownAttribute::LineNumberTable(entries) = code.attributes[0].decode(&dest)? else {
		panic!("expected a line number table");
	};
	let return_offset = {
		let mut reader = code.instructions()?;
		let mut last = 0;
		while let Some(instruction) = reader.try_read_next()? {
			last = instruction.offset;
		}
		last
	};
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].start, return_offset);
	assert_eq!(entries[0].line_number, 42);
	Ok(())
}

#[test]
fn copying_the_same_constant_twice_reuses_the_destination_slot() -> Result<()> {
	let source = ConstantPool::from_records(Version::V1_8, [integer_record(5), integer_record(6)]);

	let mut dest = PoolBuilder::new();
	let first = copy_code(&source, &mut dest, vec![LDC, 1, LDC, 2, RETURN], &[])?;
	// a second stream referencing the same source constants
	let second = copy_code(&source, &mut dest, vec![LDC, 2, RETURN], &[])?;
	let dest = dest.into_pool(Version::V1_8);

	let slot_of = |code: &[u8], index: usize| -> Result<u16> {
		let mut reader = BytecodeReader::new(code.to_vec())?;
		let mut slots = Vec::new();
		while let Some(instruction) = reader.try_read_next()? {
			if let Operand::Pool(handle) = instruction.operand {
				slots.push(handle.slot());
			}
		}
		Ok(slots[index])
	};

	// structural reuse: the 6 got the same destination slot both times
	assert_eq!(slot_of(&second.code, 0)?, slot_of(&first.code, 1)?);
	assert_eq!(dest.get_integer(ConstantHandle::new(slot_of(&second.code, 0)?, ConstantKind::Integer))?, 6);
	Ok(())
}

#[test]
fn attribute_copies_go_through_a_fresh_envelope() -> Result<()> {
	// an unknown attribute: name remapped, body untouched
	let source = ConstantPool::from_records(Version::V1_8, [utf8_record("SomethingCustom")]);

	let attribute = Attribute::new(ConstantHandle::new(1, ConstantKind::Utf8), vec![0xde, 0xad, 0xbe, 0xef]);
	let mut dest = PoolBuilder::new();
	let mut sink = Vec::new();
	attribute.copy_to(&source, &mut dest, &mut sink)?;
	let dest = dest.into_pool(Version::V1_8);

	let name_slot = u16::from_be_bytes([sink[0], sink[1]]);
	assert_eq!(dest.get_utf8(ConstantHandle::new(name_slot, ConstantKind::Utf8))?, JavaStr::from_str("SomethingCustom"));
	assert_eq!(&sink[2..6], 4u32.to_be_bytes());
	assert_eq!(&sink[6..], [0xde, 0xad, 0xbe, 0xef]);
	Ok(())
}
