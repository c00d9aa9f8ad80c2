//! Relocating code and attributes from one constant pool into another.
//!
//! Copying is decode-then-reassemble, never a byte patch: the destination
//! slot an operand remaps to may need a different operand width than the
//! source used (`ldc` growing into `ldc_w`, a switch shifting its own
//! padding), so the stream is re-walked with [`BytecodeReader`] and re-laid
//! out with [`CodeAssembler`], which re-derives every shortest encoding and
//! every displacement.

use std::collections::HashMap;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use crate::ClassWrite;
use crate::attribute::{self, CodeAttribute, KnownAttribute};
use crate::class_constants::opcode;
use crate::code::{absolute_target, AssembledCode, BytecodeReader, CodeAssembler, ExceptionHandler, Instruction, Label, Operand};
use crate::pool::{ConstantHandle, ConstantPool, ConstantResolver};

/// One copy operation's view of the two pools.
///
/// Wraps the caller's [`ConstantResolver`] with the once-per-distinct-slot
/// guarantee: however many operands reference the same source constant, the
/// policy is asked a single time and the answer reused.
pub struct CopyContext<'a> {
	source: &'a ConstantPool,
	resolver: &'a mut dyn ConstantResolver,
	resolved: HashMap<u16, ConstantHandle>,
}

impl<'a> CopyContext<'a> {
	pub fn new(source: &'a ConstantPool, resolver: &'a mut dyn ConstantResolver) -> CopyContext<'a> {
		CopyContext { source, resolver, resolved: HashMap::new() }
	}

	pub fn source(&self) -> &'a ConstantPool {
		self.source
	}

	/// The destination handle for `handle`'s referent. Nil maps to nil.
	pub fn map(&mut self, handle: ConstantHandle) -> Result<ConstantHandle> {
		if handle.is_nil() {
			return Ok(ConstantHandle::nil());
		}
		if let Some(&resolved) = self.resolved.get(&handle.slot()) {
			return Ok(resolved);
		}
		let resolved = self.resolver.resolve(self.source, handle)
			.with_context(|| anyhow!("the resolver failed on source pool slot {}", handle.slot()))?;
		self.resolved.insert(handle.slot(), resolved);
		Ok(resolved)
	}
}

/// Relocates a raw instruction stream (and its exception handler table) into
/// the pool behind `resolver`.
///
/// Branch targets survive as targets: they are converted to labels on the
/// old offsets and resolved against the new layout, so they stay equal after
/// absolute-target conversion even when operand widths shift underneath
/// them. The handler table keeps its order.
pub fn copy_code(
	source: &ConstantPool,
	resolver: &mut dyn ConstantResolver,
	code: impl Into<Bytes>,
	exceptions: &[ExceptionHandler],
) -> Result<AssembledCode> {
	let mut ctx = CopyContext::new(source, resolver);
	let (assembled, _) = copy_code_with(&mut ctx, code.into(), exceptions)?;
	Ok(assembled)
}

/// The offsets an instruction stream copy keeps track of: every label that
/// needs marking while replaying, and where each old offset ended up.
pub(crate) struct Relayout {
	labels: HashMap<u16, Label>,
	offset_map: HashMap<u16, u16>,
}

impl Relayout {
	fn label_at(&mut self, asm: &mut CodeAssembler, old_offset: u16) -> Label {
		*self.labels.entry(old_offset).or_insert_with(|| asm.create_label())
	}

	fn new_offset(&self, old_offset: u16) -> Result<u16> {
		self.offset_map.get(&old_offset).copied()
			.with_context(|| anyhow!("old bytecode offset {old_offset} is not an instruction boundary"))
	}
}

pub(crate) fn copy_code_with(
	ctx: &mut CopyContext<'_>,
	code: Bytes,
	exceptions: &[ExceptionHandler],
) -> Result<(AssembledCode, Relayout)> {
	let instructions = BytecodeReader::new(code)?.read_all()?;

	let mut asm = CodeAssembler::new();
	let mut relayout = Relayout { labels: HashMap::new(), offset_map: HashMap::new() };

	// First pass: a label for every branch target, so forward references
	// exist before the instruction that jumps to them is replayed.
	for instruction in &instructions {
		for target in branch_targets(instruction)? {
			relayout.label_at(&mut asm, target);
		}
	}
	// Handler ranges get labels too; their ends may sit at the very end of
	// the code array, one past the last instruction.
	for handler in exceptions {
		relayout.label_at(&mut asm, handler.start);
		relayout.label_at(&mut asm, handler.end);
		relayout.label_at(&mut asm, handler.handler);
	}
	for handler in exceptions {
		let start = relayout.labels[&handler.start];
		let end = relayout.labels[&handler.end];
		let target = relayout.labels[&handler.handler];
		asm.add_exception_handler(start, end, target, ctx.map(handler.catch_type)?)?;
	}

	// Second pass: replay, marking each old offset's label as it is reached.
	for instruction in &instructions {
		if let Some(&label) = relayout.labels.get(&instruction.offset) {
			asm.mark_label(label)?;
		}
		relayout.offset_map.insert(instruction.offset, asm.offset());

		replay(ctx, &mut asm, &mut relayout, instruction)
			.with_context(|| anyhow!("while copying the instruction at offset {}", instruction.offset))?;
	}

	// the end of the old code array, for exclusive range ends
	let old_end = instructions.last()
		.map(|i| i.offset + instruction_byte_length(i))
		.unwrap_or(0);
	if let Some(&label) = relayout.labels.get(&old_end) {
		asm.mark_label(label)?;
	}
	relayout.offset_map.insert(old_end, asm.offset());

	let assembled = asm.finish()?;
	Ok((assembled, relayout))
}

/// Every absolute branch target an instruction mentions.
fn branch_targets(instruction: &Instruction) -> Result<Vec<u16>> {
	Ok(match &instruction.operand {
		&Operand::Branch(displacement) => vec![absolute_target(instruction.offset, displacement)?],
		Operand::TableSwitch(payload) => {
			let mut targets = vec![absolute_target(instruction.offset, payload.default)?];
			for &displacement in &payload.offsets {
				targets.push(absolute_target(instruction.offset, displacement)?);
			}
			targets
		},
		Operand::LookupSwitch(payload) => {
			let mut targets = vec![absolute_target(instruction.offset, payload.default)?];
			for &(_, displacement) in &payload.pairs {
				targets.push(absolute_target(instruction.offset, displacement)?);
			}
			targets
		},
		_ => Vec::new(),
	})
}

/// How many bytes an instruction occupied in its source stream. Only needed
/// to find the old end-of-code offset.
fn instruction_byte_length(instruction: &Instruction) -> u16 {
	let operand = match &instruction.operand {
		Operand::None => 0,
		Operand::Local(_) => if instruction.wide { 3 } else { 1 },
		Operand::Byte(_) => 1,
		Operand::Short(_) => 2,
		Operand::Inc { .. } => if instruction.wide { 5 } else { 2 },
		Operand::Branch(_) => match instruction.opcode {
			opcode::GOTO_W | opcode::JSR_W => 4,
			_ => 2,
		},
		Operand::Pool(_) => match instruction.opcode {
			opcode::LDC => 1,
			opcode::INVOKEDYNAMIC => 4,
			_ => 2,
		},
		Operand::PoolAndCount { .. } => 4,
		Operand::PoolAndDimensions { .. } => 3,
		Operand::ArrayType(_) => 1,
		Operand::TableSwitch(payload) => {
			let padding = 3 - (instruction.offset as usize & 0b11);
			(padding + 4 + 4 + 4 + 4 * payload.offsets.len()) as u16
		},
		Operand::LookupSwitch(payload) => {
			let padding = 3 - (instruction.offset as usize & 0b11);
			(padding + 4 + 4 + 8 * payload.pairs.len()) as u16
		},
	};
	1 + operand
}

fn replay(
	ctx: &mut CopyContext<'_>,
	asm: &mut CodeAssembler,
	relayout: &mut Relayout,
	instruction: &Instruction,
) -> Result<()> {
	let op = instruction.opcode;
	match &instruction.operand {
		Operand::None => { asm.op(op)?; },
		&Operand::Byte(value) => { asm.bipush(value)?; },
		&Operand::Short(value) => { asm.sipush(value)?; },
		&Operand::Local(index) => match op {
			opcode::ILOAD..=opcode::ALOAD => { asm.load(op, index)?; },
			opcode::ISTORE..=opcode::ASTORE => { asm.store(op, index)?; },
			opcode::RET => { asm.ret(index)?; },
			_ => bail!("opcode {op:#x} can't carry a local variable index"),
		},
		&Operand::Inc { index, amount } => { asm.iinc(index, amount)?; },
		&Operand::Branch(displacement) => {
			let target = absolute_target(instruction.offset, displacement)?;
			let label = relayout.label_at(asm, target);
			asm.branch(op, label)?;
		},
		&Operand::Pool(handle) => {
			let mapped = ctx.map(handle)?;
			match op {
				// the width is re-chosen here: the destination slot may not
				// fit where the source's did
				opcode::LDC | opcode::LDC_W => { asm.ldc(mapped)?; },
				opcode::LDC2_W => { asm.ldc2(mapped)?; },
				opcode::GETSTATIC => { asm.get_static(mapped)?; },
				opcode::PUTSTATIC => { asm.put_static(mapped)?; },
				opcode::GETFIELD => { asm.get_field(mapped)?; },
				opcode::PUTFIELD => { asm.put_field(mapped)?; },
				opcode::INVOKEVIRTUAL => { asm.invoke_virtual(mapped)?; },
				opcode::INVOKESPECIAL => { asm.invoke_special(mapped)?; },
				opcode::INVOKESTATIC => { asm.invoke_static(mapped)?; },
				opcode::INVOKEDYNAMIC => { asm.invoke_dynamic(mapped)?; },
				opcode::NEW => { asm.new_object(mapped)?; },
				opcode::ANEWARRAY => { asm.anewarray(mapped)?; },
				opcode::CHECKCAST => { asm.checkcast(mapped)?; },
				opcode::INSTANCEOF => { asm.instance_of(mapped)?; },
				_ => bail!("opcode {op:#x} can't carry a pool reference"),
			}
		},
		&Operand::PoolAndCount { reference, count } => {
			// the count byte is derived from the descriptor, which the copy
			// doesn't change, so it carries over
			asm.invoke_interface(ctx.map(reference)?, count)?;
		},
		&Operand::PoolAndDimensions { class, dimensions } => {
			asm.multianewarray(ctx.map(class)?, dimensions)?;
		},
		&Operand::ArrayType(element_type) => { asm.newarray(element_type)?; },
		Operand::TableSwitch(payload) => {
			let default = relayout.label_at(asm, absolute_target(instruction.offset, payload.default)?);
			let cases = payload.offsets.iter()
				.map(|&displacement| Ok(relayout.label_at(asm, absolute_target(instruction.offset, displacement)?)))
				.collect::<Result<Vec<_>>>()?;
			asm.table_switch(default, payload.low, &cases)?;
		},
		Operand::LookupSwitch(payload) => {
			let default = relayout.label_at(asm, absolute_target(instruction.offset, payload.default)?);
			let pairs = payload.pairs.iter()
				.map(|&(key, displacement)| Ok((key, relayout.label_at(asm, absolute_target(instruction.offset, displacement)?))))
				.collect::<Result<Vec<_>>>()?;
			asm.lookup_switch(default, &pairs)?;
		},
	}
	Ok(())
}

/// Re-emits a whole `Code` attribute body into `sink` against the
/// destination pool: instructions and exception table relocated, nested
/// `LineNumberTable`s rewritten onto the new offsets, every other nested
/// attribute copied through the regular attribute contract.
pub(crate) fn copy_code_attribute(ctx: &mut CopyContext<'_>, code: &CodeAttribute, sink: &mut Vec<u8>) -> Result<()> {
	let (assembled, relayout) = copy_code_with(ctx, code.code.clone(), &code.exception_table)?;

	sink.write_u16(code.max_stack)?;
	sink.write_u16(code.max_locals)?;

	let code_length = assembled.code.len();
	if code_length == 0 || code_length > u16::MAX as usize {
		bail!("`code_length` must be greater than zero and less than 65536, got {code_length:?}");
	}
	sink.write_usize_as_u32(code_length)?;
	sink.write_u8_slice(&assembled.code)?;

	assembled.write_exception_table(sink)?;

	sink.write_usize_as_u16(code.attributes.len()).context("too many nested attributes")?;
	for attribute in &code.attributes {
		match attribute.decode(ctx.source())? {
			// line starts are bytecode offsets into the array that was just
			// re-laid out, so they go through the offset map
			KnownAttribute::LineNumberTable(entries) => {
				let entries = entries.into_iter()
					.map(|entry| Ok(attribute::LineNumberEntry {
						start: relayout.new_offset(entry.start)
							.context("a LineNumberTable entry points between instructions")?,
						line_number: entry.line_number,
					}))
					.collect::<Result<Vec<_>>>()?;

				let mut buffer = Vec::new();
				attribute::write_line_number_table(&mut buffer, &entries)?;

				sink.write_u16(ctx.map(attribute.name)?.slot())?;
				sink.write_usize_as_u32(buffer.len())?;
				sink.write_u8_slice(&buffer)?;
			},
			_ => attribute.copy_with(ctx, sink)?,
		}
	}

	Ok(())
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use pretty_assertions::assert_eq;
	use crate::class_constants::opcode;
	use crate::code::BytecodeReader;
	use crate::pool::{ConstantHandle, ConstantKind, ConstantPool, ConstantResolver, PoolBuilder, RawConstant};
	use crate::version::Version;

	#[test]
	fn ldc_operands_remap_and_keep_their_value() -> Result<()> {
		// source pool: Integer 1234 at slot 1
		let source = ConstantPool::from_records(Version::V1_8, [
			RawConstant { kind: ConstantKind::Integer, data: 1234i32.to_be_bytes().to_vec().into() },
		]);

		let mut dest = PoolBuilder::new();
		let assembled = super::copy_code(&source, &mut dest, vec![opcode::LDC, 1, opcode::RETURN], &[])?;

		let mut reader = BytecodeReader::new(assembled.code)?;
		let Some(crate::code::Instruction { operand: crate::code::Operand::Pool(handle), .. }) = reader.try_read_next()? else {
			panic!("expected an ldc");
		};
		assert_eq!(dest.into_pool(Version::V1_8).get_integer(handle.expecting(ConstantKind::Integer))?, 1234);
		Ok(())
	}

	#[test]
	fn resolution_happens_once_per_distinct_constant() -> Result<()> {
		struct CountingResolver {
			inner: PoolBuilder,
			calls: usize,
		}
		impl ConstantResolver for CountingResolver {
			fn resolve(&mut self, source: &ConstantPool, handle: ConstantHandle) -> Result<ConstantHandle> {
				self.calls += 1;
				self.inner.resolve(source, handle)
			}
		}

		let source = ConstantPool::from_records(Version::V1_8, [
			RawConstant { kind: ConstantKind::Integer, data: 7i32.to_be_bytes().to_vec().into() },
		]);

		let mut resolver = CountingResolver { inner: PoolBuilder::new(), calls: 0 };
		// the same slot referenced three times
		super::copy_code(&source, &mut resolver, vec![
			opcode::LDC, 1,
			opcode::LDC, 1,
			opcode::LDC, 1,
			opcode::RETURN,
		], &[])?;

		assert_eq!(resolver.calls, 1);
		Ok(())
	}
}
