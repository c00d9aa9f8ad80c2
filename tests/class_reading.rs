use anyhow::Result;
use java_string::JavaStr;
use pretty_assertions::assert_eq;
use arabica::ClassError;
use arabica::attribute::KnownAttribute;
use arabica::pool::{ConstantData, ConstantHandle, ConstantKind};

fn u16be(value: u16) -> [u8; 2] {
	value.to_be_bytes()
}

fn utf8_entry(bytes: &mut Vec<u8>, s: &str) {
	bytes.push(1); // Utf8 tag
	bytes.extend_from_slice(&u16be(s.len() as u16));
	bytes.extend_from_slice(s.as_bytes());
}

/// `class Main { int value; Main() {} }`, laid out by hand.
fn minimal_class() -> Vec<u8> {
	let mut b = Vec::new();
	b.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
	b.extend_from_slice(&u16be(0));  // minor
	b.extend_from_slice(&u16be(52)); // major

	b.extend_from_slice(&u16be(14)); // constant pool count
	utf8_entry(&mut b, "org/example/Main");     // 1
	b.push(7); b.extend_from_slice(&u16be(1));  // 2: Class
	utf8_entry(&mut b, "java/lang/Object");     // 3
	b.push(7); b.extend_from_slice(&u16be(3));  // 4: Class
	utf8_entry(&mut b, "<init>");               // 5
	utf8_entry(&mut b, "()V");                  // 6
	utf8_entry(&mut b, "Code");                 // 7
	utf8_entry(&mut b, "SourceFile");           // 8
	utf8_entry(&mut b, "Main.java");            // 9
	b.push(10); b.extend_from_slice(&u16be(4)); b.extend_from_slice(&u16be(11)); // 10: Methodref
	b.push(12); b.extend_from_slice(&u16be(5)); b.extend_from_slice(&u16be(6));  // 11: NameAndType
	utf8_entry(&mut b, "value");                // 12
	utf8_entry(&mut b, "I");                    // 13

	b.extend_from_slice(&u16be(0x0020)); // access flags (ACC_SUPER)
	b.extend_from_slice(&u16be(2)); // this
	b.extend_from_slice(&u16be(4)); // super
	b.extend_from_slice(&u16be(0)); // no interfaces

	b.extend_from_slice(&u16be(1)); // one field
	b.extend_from_slice(&u16be(0));  // access
	b.extend_from_slice(&u16be(12)); // name
	b.extend_from_slice(&u16be(13)); // descriptor
	b.extend_from_slice(&u16be(0));  // no attributes

	b.extend_from_slice(&u16be(1)); // one method
	b.extend_from_slice(&u16be(0)); // access
	b.extend_from_slice(&u16be(5)); // name
	b.extend_from_slice(&u16be(6)); // descriptor
	b.extend_from_slice(&u16be(1)); // one attribute: Code
	b.extend_from_slice(&u16be(7));
	b.extend_from_slice(&17u32.to_be_bytes());
	b.extend_from_slice(&u16be(1)); // max_stack
	b.extend_from_slice(&u16be(1)); // max_locals
	b.extend_from_slice(&5u32.to_be_bytes());
	b.extend_from_slice(&[
		0x2a,             // aload_0
		0xb7, 0x00, 0x0a, // invokespecial #10
		0xb1,             // return
	]);
	b.extend_from_slice(&u16be(0)); // no exception handlers
	b.extend_from_slice(&u16be(0)); // no nested attributes

	b.extend_from_slice(&u16be(1)); // one class attribute: SourceFile
	b.extend_from_slice(&u16be(8));
	b.extend_from_slice(&2u32.to_be_bytes());
	b.extend_from_slice(&u16be(9));

	b
}

#[test]
fn enumeration_matches_the_declared_counts() -> Result<()> {
	let class = arabica::read_class(minimal_class())?;

	assert_eq!(class.field_count(), 1);
	assert_eq!(class.method_count(), 1);
	assert_eq!(class.attribute_count(), 1);

	assert_eq!(class.fields().count(), 1);
	assert_eq!(class.methods().count(), 1);
	assert_eq!(class.attributes().count(), 1);
	assert_eq!(class.interfaces().len(), 0);

	// every handle the model handed out resolves in bounds
	for field in class.fields() {
		let field = field?;
		class.pool().get(field.name)?;
		class.pool().get(field.descriptor)?;
	}
	for method in class.methods() {
		let method = method?;
		assert_eq!(class.pool().get_utf8(method.name)?, JavaStr::from_str("<init>"));
		assert_eq!(class.pool().get_utf8(method.descriptor)?, JavaStr::from_str("()V"));
	}
	assert_eq!(class.pool().get_class_name(class.this_class())?, JavaStr::from_str("org/example/Main"));
	assert_eq!(class.pool().get_class_name(class.super_class())?, JavaStr::from_str("java/lang/Object"));
	Ok(())
}

#[test]
fn collections_enumerate_repeatedly() -> Result<()> {
	let class = arabica::read_class(minimal_class())?;

	let first: Vec<_> = class.methods().collect::<Result<_>>()?;
	let second: Vec<_> = class.methods().collect::<Result<_>>()?;
	assert_eq!(first, second);

	// and the attribute walk inside a member restarts too
	let method = class.methods().next().expect("one method")?;
	assert_eq!(method.attributes.iter().count(), 1);
	assert_eq!(method.attributes.iter().count(), 1);
	Ok(())
}

#[test]
fn the_code_attribute_decodes_through_the_registry() -> Result<()> {
	let class = arabica::read_class(minimal_class())?;
	let method = class.methods().next().expect("one method")?;
	let attribute = method.attributes.iter().next().expect("one attribute")?;

	let KnownAttribute::Code(code) = attribute.decode(class.pool())? else {
		panic!("expected the Code attribute");
	};
	assert_eq!((code.max_stack, code.max_locals), (1, 1));

	let mut reader = code.instructions()?;
	let mut opcodes = Vec::new();
	while let Some(instruction) = reader.try_read_next()? {
		opcodes.push(instruction.opcode);
	}
	// aload (normalized from aload_0), invokespecial, return
	assert_eq!(opcodes, [0x19, 0xb7, 0xb1]);

	// the invokespecial operand resolves to the Object constructor
	let mut reader = code.instructions()?;
	reader.try_read_next()?;
	let Some(invoke) = reader.try_read_next()? else { panic!("expected an instruction") };
	let arabica::code::Operand::Pool(handle) = invoke.operand else { panic!("expected a pool operand") };
	let ConstantData::MethodRef { class: owner, name_and_type } = class.pool().read(handle)? else {
		panic!("expected a method ref");
	};
	assert_eq!(class.pool().get_class_name(owner)?, JavaStr::from_str("java/lang/Object"));
	let (name, descriptor) = class.pool().get_name_and_type(name_and_type)?;
	assert_eq!(name, JavaStr::from_str("<init>"));
	assert_eq!(descriptor, JavaStr::from_str("()V"));
	Ok(())
}

#[test]
fn view_and_typed_read_agree_on_the_kind() -> Result<()> {
	let class = arabica::read_class(minimal_class())?;
	let pool = class.pool();

	for view in pool.iter() {
		if view.kind == ConstantKind::Unknown {
			continue;
		}
		let data = pool.read(view.handle())?;
		assert_eq!(view.kind, data.kind());
	}
	Ok(())
}

#[test]
fn mistyped_reads_fail_as_invalid_reference() -> Result<()> {
	let class = arabica::read_class(minimal_class())?;

	// slot 1 stores Utf8, the handle claims Integer
	let err = class.pool().read(ConstantHandle::new(1, ConstantKind::Integer)).unwrap_err();
	assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::InvalidReference(_))));

	// but a plain look at the slot is fine
	assert_eq!(class.pool().get(ConstantHandle::new(1, ConstantKind::Integer))?.kind, ConstantKind::Utf8);
	Ok(())
}

#[test]
fn empty_input_is_a_malformed_header() {
	let err = arabica::read_class(Vec::new()).unwrap_err();
	assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::MalformedHeader(_))));
}

#[test]
fn zeroed_input_is_a_malformed_header_not_a_generic_failure() {
	for len in [10, 35] {
		let err = arabica::read_class(vec![0u8; len]).unwrap_err();
		assert!(
			matches!(err.downcast_ref::<ClassError>(), Some(ClassError::MalformedHeader(_))),
			"a {len}-byte zeroed stream should fail on its magic, got: {err:#}"
		);
	}
}

#[test]
fn truncation_past_the_header_is_its_own_condition() {
	// a valid header, then nothing where the pool count should be
	let mut bytes = 0xCAFE_BABEu32.to_be_bytes().to_vec();
	bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x34]);
	let err = arabica::read_class(bytes).unwrap_err();
	assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::Truncated(_))));
}

#[test]
fn truncated_member_tables_fail_at_decode_time() {
	let full = minimal_class();
	// cut the stream in the middle of the method table
	let err = arabica::read_class(full[..full.len() - 20].to_vec()).unwrap_err();
	assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::Truncated(_))));
}
