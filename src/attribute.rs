//! The attribute framework: name-tagged, length-prefixed records that
//! anything in a class file can carry.
//!
//! Reading the envelope ([`Attribute`]) always succeeds; giving the body a
//! shape is a separate, dispatched step ([`Attribute::decode`]) keyed on the
//! name resolved against the pool. Names this crate doesn't know stay
//! opaque and still re-serialize and copy byte for byte. A recognized name
//! over a body that doesn't parse is
//! [`ClassError::UnsupportedBody`](crate::ClassError), not silently opaque.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use java_string::{JavaStr, JavaString};
use crate::{ByteCursor, ClassRead, ClassWrite};
use crate::class_constants::attribute as name;
use crate::code::{BytecodeReader, ExceptionHandler};
use crate::copy::CopyContext;
use crate::error::ClassError;
use crate::pool::{ConstantHandle, ConstantKind, ConstantPool, ConstantResolver};

pub mod annotation;

use annotation::{Annotation, TypeAnnotation};

/// One attribute, undecoded: its name handle and its raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
	/// A `Utf8` handle holding the attribute's name.
	pub name: ConstantHandle,
	pub body: Bytes,
}

impl Attribute {
	pub fn new(name: ConstantHandle, body: impl Into<Bytes>) -> Attribute {
		Attribute { name: name.expecting(ConstantKind::Utf8), body: body.into() }
	}

	/// Reads one attribute record: name, length, that many body bytes.
	pub(crate) fn read(reader: &mut ByteCursor) -> Result<Attribute> {
		let name = ConstantHandle::new(reader.read_u16()?, ConstantKind::Utf8);
		let length = reader.read_u32_as_usize()?;
		let body = reader.read_slice(length)
			.with_context(|| anyhow!("failed to read attribute body of {length} bytes"))?;
		Ok(Attribute { name, body })
	}

	/// Resolves this attribute's name against the pool.
	pub fn name_string(&self, pool: &ConstantPool) -> Result<JavaString> {
		pool.get_utf8(self.name)
	}

	/// Writes the attribute record back out, body verbatim.
	pub fn write(&self, sink: &mut Vec<u8>) -> Result<()> {
		sink.write_u16(self.name.slot())?;
		sink.write_usize_as_u32(self.body.len()).context("attribute is too large")?;
		sink.write_u8_slice(&self.body)
	}

	/// Decodes the body by the shape registered for this attribute's name.
	pub fn decode(&self, pool: &ConstantPool) -> Result<KnownAttribute> {
		let attribute_name = self.name_string(pool)
			.context("can't resolve the attribute's name")?;

		let known = match attribute_name.as_java_str() {
			n if name_is(n, name::CODE) => self.decode_body(&attribute_name, |r| CodeAttribute::parse(r).map(KnownAttribute::Code))?,
			n if name_is(n, name::CONSTANT_VALUE) => self.decode_body(&attribute_name, |r| {
				// any loadable constant may be the value, its kind is the field's business
				Ok(KnownAttribute::ConstantValue(ConstantHandle::new(r.read_u16()?, ConstantKind::Unknown)))
			})?,
			n if name_is(n, name::SOURCE_FILE) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::SourceFile(ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8)))
			})?,
			n if name_is(n, name::SIGNATURE) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::Signature(ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8)))
			})?,
			n if name_is(n, name::EXCEPTIONS) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::Exceptions(r.read_vec(
					|r| r.read_u16_as_usize(),
					|r| Ok(ConstantHandle::new(r.read_u16()?, ConstantKind::Class)),
				)?))
			})?,
			n if name_is(n, name::LINE_NUMBER_TABLE) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::LineNumberTable(r.read_vec(
					|r| r.read_u16_as_usize(),
					|r| Ok(LineNumberEntry { start: r.read_u16()?, line_number: r.read_u16()? }),
				)?))
			})?,
			n if name_is(n, name::RUNTIME_VISIBLE_ANNOTATIONS) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::RuntimeVisibleAnnotations(read_annotation_table(r)?))
			})?,
			n if name_is(n, name::RUNTIME_INVISIBLE_ANNOTATIONS) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::RuntimeInvisibleAnnotations(read_annotation_table(r)?))
			})?,
			n if name_is(n, name::RUNTIME_VISIBLE_TYPE_ANNOTATIONS) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::RuntimeVisibleTypeAnnotations(read_type_annotation_table(r)?))
			})?,
			n if name_is(n, name::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS) => self.decode_body(&attribute_name, |r| {
				Ok(KnownAttribute::RuntimeInvisibleTypeAnnotations(read_type_annotation_table(r)?))
			})?,
			_ => {
				log::trace!("attribute {attribute_name:?} has no registered shape, keeping it opaque");
				KnownAttribute::Unknown(self.clone())
			},
		};
		Ok(known)
	}

	/// Runs a body parser and holds it to the whole-body contract: any parse
	/// failure, and any trailing bytes, make the attribute
	/// [`ClassError::UnsupportedBody`].
	fn decode_body(
		&self,
		attribute_name: &JavaString,
		parse: impl FnOnce(&mut ByteCursor) -> Result<KnownAttribute>,
	) -> Result<KnownAttribute> {
		let mut reader = ByteCursor::new(self.body.clone());
		let result = parse(&mut reader).and_then(|known| {
			if !reader.is_at_end() {
				bail!("{} trailing bytes", reader.remaining());
			}
			Ok(known)
		});
		result.map_err(|e| anyhow!(ClassError::UnsupportedBody(format!(
			"the {attribute_name:?} attribute body doesn't parse: {e:#}"
		))))
	}

	/// Re-emits this attribute into `sink` against a different constant
	/// pool, remapping the name and every reference the body carries through
	/// `resolver`.
	///
	/// Known shapes are decoded and rebuilt; unknown bodies are copied
	/// verbatim (they can't reference anything this crate could remap).
	/// The resolver is consulted once per distinct source constant.
	pub fn copy_to(&self, source: &ConstantPool, resolver: &mut dyn ConstantResolver, sink: &mut Vec<u8>) -> Result<()> {
		let mut ctx = CopyContext::new(source, resolver);
		self.copy_with(&mut ctx, sink)
	}

	pub(crate) fn copy_with(&self, ctx: &mut CopyContext<'_>, sink: &mut Vec<u8>) -> Result<()> {
		let decoded = self.decode(ctx.source())?;
		let name = ctx.map(self.name)?;

		// the body is built in its own buffer, its length isn't known up front
		let mut buffer = Vec::new();
		match decoded {
			KnownAttribute::Code(code) => crate::copy::copy_code_attribute(ctx, &code, &mut buffer)?,
			KnownAttribute::ConstantValue(value) => buffer.write_u16(ctx.map(value)?.slot())?,
			KnownAttribute::SourceFile(value) => buffer.write_u16(ctx.map(value)?.slot())?,
			KnownAttribute::Signature(value) => buffer.write_u16(ctx.map(value)?.slot())?,
			KnownAttribute::Exceptions(classes) => {
				buffer.write_usize_as_u16(classes.len()).context("too many exception classes")?;
				for class in classes {
					buffer.write_u16(ctx.map(class)?.slot())?;
				}
			},
			KnownAttribute::LineNumberTable(entries) => {
				// standalone copy: the offsets only shift when the owning
				// code array is rebuilt, and then the Code copy rewrites them
				write_line_number_table(&mut buffer, &entries)?;
			},
			KnownAttribute::RuntimeVisibleAnnotations(annotations) |
			KnownAttribute::RuntimeInvisibleAnnotations(annotations) => {
				buffer.write_usize_as_u16(annotations.len()).context("too many annotations")?;
				for a in &annotations {
					annotation::write_annotation(&mut buffer, &a.remap(ctx)?)?;
				}
			},
			KnownAttribute::RuntimeVisibleTypeAnnotations(annotations) |
			KnownAttribute::RuntimeInvisibleTypeAnnotations(annotations) => {
				buffer.write_usize_as_u16(annotations.len()).context("too many type annotations")?;
				for a in &annotations {
					let remapped = TypeAnnotation { target: a.target.clone(), annotation: a.annotation.remap(ctx)? };
					annotation::write_type_annotation(&mut buffer, &remapped)?;
				}
			},
			KnownAttribute::Unknown(attribute) => buffer.write_u8_slice(&attribute.body)?,
		}

		sink.write_u16(name.slot())?;
		sink.write_usize_as_u32(buffer.len()).context("attribute is too large")?;
		sink.write_u8_slice(&buffer)
	}
}

fn name_is(n: &JavaStr, expected: &str) -> bool {
	n == JavaStr::from_str(expected)
}

fn read_annotation_table(reader: &mut ByteCursor) -> Result<Vec<Annotation>> {
	reader.read_vec(|r| r.read_u16_as_usize(), annotation::read_annotation)
}

fn read_type_annotation_table(reader: &mut ByteCursor) -> Result<Vec<TypeAnnotation>> {
	reader.read_vec(|r| r.read_u16_as_usize(), annotation::read_type_annotation)
}

pub(crate) fn write_line_number_table(sink: &mut Vec<u8>, entries: &[LineNumberEntry]) -> Result<()> {
	sink.write_slice(entries,
		|w, len| w.write_usize_as_u16(len).context("too many line number entries"),
		|w, entry| {
			w.write_u16(entry.start)?;
			w.write_u16(entry.line_number)
		},
	)
}

/// An attribute body decoded by the shape its name is registered with.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownAttribute {
	Code(CodeAttribute),
	/// The loadable constant of a `final` field.
	ConstantValue(ConstantHandle),
	/// A `Utf8` handle holding the source file name.
	SourceFile(ConstantHandle),
	/// A `Utf8` handle holding a generic signature.
	Signature(ConstantHandle),
	/// The `Class` handles of a method's declared thrown exceptions.
	Exceptions(Vec<ConstantHandle>),
	LineNumberTable(Vec<LineNumberEntry>),
	RuntimeVisibleAnnotations(Vec<Annotation>),
	RuntimeInvisibleAnnotations(Vec<Annotation>),
	RuntimeVisibleTypeAnnotations(Vec<TypeAnnotation>),
	RuntimeInvisibleTypeAnnotations(Vec<TypeAnnotation>),
	/// No shape registered for the name; the envelope, verbatim.
	Unknown(Attribute),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
	/// The bytecode offset the source line starts at.
	pub start: u16,
	pub line_number: u16,
}

/// The decoded body of a `Code` attribute: the stack and local sizes, the
/// code array, the exception handler table in match order, and the nested
/// attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
	pub max_stack: u16,
	pub max_locals: u16,
	pub code: Bytes,
	pub exception_table: Vec<ExceptionHandler>,
	pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
	pub(crate) fn parse(reader: &mut ByteCursor) -> Result<CodeAttribute> {
		let max_stack = reader.read_u16()?;
		let max_locals = reader.read_u16()?;

		let code_length = reader.read_u32()?;
		// the limit is the Java Virtual Machine Specification's, and it is
		// what keeps every bytecode offset in an u16
		if code_length == 0 || code_length > u16::MAX as u32 {
			bail!("`code_length` must be greater than zero and less than 65536, got {code_length:?}");
		}
		let code = reader.read_slice(code_length as usize)?;

		let exception_table = reader.read_vec(
			|r| r.read_u16_as_usize(),
			|r| Ok(ExceptionHandler {
				start: r.read_u16()?,
				end: r.read_u16()?,
				handler: r.read_u16()?,
				catch_type: catch_type_handle(r.read_u16()?),
			}),
		)?;

		let attributes = reader.read_vec(|r| r.read_u16_as_usize(), Attribute::read)?;

		Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
	}

	/// A fresh instruction cursor over the code array.
	pub fn instructions(&self) -> Result<BytecodeReader> {
		BytecodeReader::new(self.code.clone())
	}

	/// Re-emits this attribute's body into `sink` against a different
	/// constant pool: instructions, exception table and nested attributes
	/// relocated, operand widths re-derived. [`Attribute::copy_to`] is the
	/// same operation including the name/length envelope.
	pub fn copy_to(&self, source: &ConstantPool, resolver: &mut dyn ConstantResolver, sink: &mut Vec<u8>) -> Result<()> {
		let mut ctx = CopyContext::new(source, resolver);
		crate::copy::copy_code_attribute(&mut ctx, self, sink)
	}

	/// Writes the attribute body (everything after the generic name/length
	/// envelope).
	pub fn write(&self, sink: &mut Vec<u8>) -> Result<()> {
		sink.write_u16(self.max_stack)?;
		sink.write_u16(self.max_locals)?;

		let code_length = self.code.len();
		if code_length == 0 || code_length > u16::MAX as usize {
			bail!("`code_length` must be greater than zero and less than 65536, got {code_length:?}");
		}
		sink.write_usize_as_u32(code_length)?;
		sink.write_u8_slice(&self.code)?;

		sink.write_slice(&self.exception_table,
			|w, len| w.write_usize_as_u16(len).context("too many exception handlers"),
			|w, handler| {
				w.write_u16(handler.start)?;
				w.write_u16(handler.end)?;
				w.write_u16(handler.handler)?;
				w.write_u16(handler.catch_type.slot())
			},
		)?;

		sink.write_slice(&self.attributes,
			|w, len| w.write_usize_as_u16(len).context("too many nested attributes"),
			|w, attribute| attribute.write(w),
		)
	}
}

fn catch_type_handle(slot: u16) -> ConstantHandle {
	if slot == 0 {
		ConstantHandle::nil()
	} else {
		ConstantHandle::new(slot, ConstantKind::Class)
	}
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use bytes::Bytes;
	use pretty_assertions::assert_eq;
	use crate::ByteCursor;
	use crate::attribute::{Attribute, CodeAttribute, KnownAttribute};
	use crate::class_constants::opcode;
	use crate::error::ClassError;
	use crate::pool::{ConstantKind, ConstantPool, RawConstant};
	use crate::version::Version;

	fn utf8_record(s: &str) -> RawConstant {
		let mut data = (s.len() as u16).to_be_bytes().to_vec();
		data.extend_from_slice(s.as_bytes());
		RawConstant { kind: ConstantKind::Utf8, data: data.into() }
	}

	fn pool_with_names(names: &[&str]) -> ConstantPool {
		ConstantPool::from_records(Version::V1_8, names.iter().map(|n| utf8_record(n)))
	}

	#[test]
	fn unknown_names_decode_opaque() -> Result<()> {
		let pool = pool_with_names(&["SomethingCustom"]);
		let mut reader = ByteCursor::new(Bytes::from_static(&[
			0x00, 0x01,             // name
			0x00, 0x00, 0x00, 0x02, // length
			0xde, 0xad,
		]));
		let attribute = Attribute::read(&mut reader)?;
		let decoded = attribute.decode(&pool)?;
		assert_eq!(decoded, KnownAttribute::Unknown(attribute));
		Ok(())
	}

	#[test]
	fn recognized_name_with_bad_body_is_unsupported() {
		let pool = pool_with_names(&["SourceFile"]);
		// a SourceFile body is exactly two bytes; three is a parse failure
		let attribute = Attribute {
			name: crate::pool::ConstantHandle::new(1, ConstantKind::Utf8),
			body: Bytes::from_static(&[0x00, 0x01, 0x00]),
		};
		let err = attribute.decode(&pool).unwrap_err();
		assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::UnsupportedBody(_))));
	}

	#[test]
	fn code_attributes_round_trip() -> Result<()> {
		let pool = pool_with_names(&["Code"]);

		let mut body = Vec::new();
		body.extend_from_slice(&[0x00, 0x02]); // max_stack
		body.extend_from_slice(&[0x00, 0x01]); // max_locals
		body.extend_from_slice(&3u32.to_be_bytes());
		body.extend_from_slice(&[opcode::NOP, opcode::NOP, opcode::RETURN]);
		body.extend_from_slice(&[0x00, 0x01]); // one handler
		body.extend_from_slice(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x02, 0x00, 0x00]); // catch-all
		body.extend_from_slice(&[0x00, 0x00]); // no nested attributes

		let attribute = Attribute {
			name: crate::pool::ConstantHandle::new(1, ConstantKind::Utf8),
			body: body.clone().into(),
		};
		let KnownAttribute::Code(code) = attribute.decode(&pool)? else {
			panic!("expected a Code attribute");
		};
		assert_eq!((code.max_stack, code.max_locals), (2, 1));
		assert_eq!(code.exception_table.len(), 1);
		assert!(code.exception_table[0].is_catch_all());

		let mut sink = Vec::new();
		code.write(&mut sink)?;
		assert_eq!(sink, body);
		Ok(())
	}

	#[test]
	fn empty_code_arrays_are_rejected() {
		let mut body = Vec::new();
		body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
		body.extend_from_slice(&0u32.to_be_bytes());
		body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
		assert!(CodeAttribute::parse(&mut ByteCursor::new(body.into())).is_err());
	}
}
