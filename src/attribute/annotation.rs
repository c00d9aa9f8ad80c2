//! The annotation structures of the four `Runtime*Annotations` attribute
//! tables.
//!
//! Element values keep their constant pool references as handles, which is
//! what lets a whole annotation table be relocated into another pool by
//! remapping and re-serializing it.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use crate::{ByteCursor, ClassRead, ClassWrite};
use crate::copy::CopyContext;
use crate::pool::{ConstantHandle, ConstantKind};

/// One annotation: the field descriptor of its type, and its named element
/// values.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
	/// A `Utf8` handle holding a field descriptor.
	pub type_descriptor: ConstantHandle,
	pub pairs: Vec<ElementValuePair>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementValuePair {
	/// A `Utf8` handle holding the element name.
	pub name: ConstantHandle,
	pub value: ElementValue,
}

/// The value of one annotation element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
	/// A primitive or string value: the tag is one of `BCDFIJSZs` and the
	/// handle points at the matching constant kind.
	Constant { tag: u8, value: ConstantHandle },
	EnumConstant {
		/// A `Utf8` handle holding the enum type's field descriptor.
		type_name: ConstantHandle,
		/// A `Utf8` handle holding the enum constant's simple name.
		const_name: ConstantHandle,
	},
	/// A `Utf8` handle holding a return descriptor.
	Class(ConstantHandle),
	Annotation(Box<Annotation>),
	Array(Vec<ElementValue>),
}

/// A type annotation: where it sits (the raw `target_info` and `type_path`,
/// which contain bytecode offsets and indices but no pool references) plus
/// the annotation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeAnnotation {
	/// The `target_type`, `target_info` and `type_path` bytes, verbatim.
	pub target: Bytes,
	pub annotation: Annotation,
}

/// The constant kind an element value tag's handle must reference.
fn element_value_kind(tag: u8) -> Result<ConstantKind> {
	Ok(match tag {
		b'B' | b'C' | b'I' | b'S' | b'Z' => ConstantKind::Integer,
		b'D' => ConstantKind::Double,
		b'F' => ConstantKind::Float,
		b'J' => ConstantKind::Long,
		b's' => ConstantKind::Utf8,
		_ => bail!("unexpected element value tag {tag}"),
	})
}

pub(crate) fn read_annotation(reader: &mut ByteCursor) -> Result<Annotation> {
	let type_descriptor = ConstantHandle::new(reader.read_u16()?, ConstantKind::Utf8);
	let pairs = reader.read_vec(
		|r| r.read_u16_as_usize(),
		|r| Ok(ElementValuePair {
			name: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			value: read_element_value(r)?,
		}),
	)?;
	Ok(Annotation { type_descriptor, pairs })
}

fn read_element_value(reader: &mut ByteCursor) -> Result<ElementValue> {
	let tag = reader.read_u8()?;
	Ok(match tag {
		b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => ElementValue::Constant {
			tag,
			value: ConstantHandle::new(reader.read_u16()?, element_value_kind(tag)?),
		},
		b'e' => ElementValue::EnumConstant {
			type_name: ConstantHandle::new(reader.read_u16()?, ConstantKind::Utf8),
			const_name: ConstantHandle::new(reader.read_u16()?, ConstantKind::Utf8),
		},
		b'c' => ElementValue::Class(ConstantHandle::new(reader.read_u16()?, ConstantKind::Utf8)),
		b'@' => ElementValue::Annotation(Box::new(read_annotation(reader)?)),
		b'[' => ElementValue::Array(reader.read_vec(
			|r| r.read_u16_as_usize(),
			read_element_value,
		)?),
		tag => bail!("unexpected element value tag {tag}"),
	})
}

pub(crate) fn write_annotation(sink: &mut Vec<u8>, annotation: &Annotation) -> Result<()> {
	sink.write_u16(annotation.type_descriptor.slot())?;
	sink.write_slice(&annotation.pairs,
		|w, len| w.write_usize_as_u16(len).context("too many element value pairs"),
		|w, pair| {
			w.write_u16(pair.name.slot())?;
			write_element_value(w, &pair.value)
		},
	)
}

fn write_element_value(sink: &mut Vec<u8>, value: &ElementValue) -> Result<()> {
	match value {
		&ElementValue::Constant { tag, value } => {
			sink.write_u8(tag)?;
			sink.write_u16(value.slot())?;
		},
		&ElementValue::EnumConstant { type_name, const_name } => {
			sink.write_u8(b'e')?;
			sink.write_u16(type_name.slot())?;
			sink.write_u16(const_name.slot())?;
		},
		&ElementValue::Class(class_info) => {
			sink.write_u8(b'c')?;
			sink.write_u16(class_info.slot())?;
		},
		ElementValue::Annotation(annotation) => {
			sink.write_u8(b'@')?;
			write_annotation(sink, annotation)?;
		},
		ElementValue::Array(values) => {
			sink.write_u8(b'[')?;
			sink.write_slice(values,
				|w, len| w.write_usize_as_u16(len).context("too many element values"),
				write_element_value,
			)?;
		},
	}
	Ok(())
}

impl Annotation {
	/// The same annotation, with every handle resolved into the destination
	/// pool of `ctx`.
	pub(crate) fn remap(&self, ctx: &mut CopyContext<'_>) -> Result<Annotation> {
		Ok(Annotation {
			type_descriptor: ctx.map(self.type_descriptor)?,
			pairs: self.pairs.iter()
				.map(|pair| Ok(ElementValuePair {
					name: ctx.map(pair.name)?,
					value: pair.value.remap(ctx)?,
				}))
				.collect::<Result<Vec<_>>>()?,
		})
	}
}

impl ElementValue {
	fn remap(&self, ctx: &mut CopyContext<'_>) -> Result<ElementValue> {
		Ok(match self {
			&ElementValue::Constant { tag, value } => ElementValue::Constant { tag, value: ctx.map(value)? },
			&ElementValue::EnumConstant { type_name, const_name } => ElementValue::EnumConstant {
				type_name: ctx.map(type_name)?,
				const_name: ctx.map(const_name)?,
			},
			&ElementValue::Class(class_info) => ElementValue::Class(ctx.map(class_info)?),
			ElementValue::Annotation(annotation) => ElementValue::Annotation(Box::new(annotation.remap(ctx)?)),
			ElementValue::Array(values) => ElementValue::Array(
				values.iter().map(|value| value.remap(ctx)).collect::<Result<Vec<_>>>()?
			),
		})
	}
}

/// Reads one type annotation, keeping its target raw.
///
/// The `target_info` union and the `type_path` hold bytecode offsets, type
/// parameter indices and the like, never pool references, so they pass
/// through copies verbatim. They still have to be parsed enough to know
/// where they end.
pub(crate) fn read_type_annotation(reader: &mut ByteCursor) -> Result<TypeAnnotation> {
	let start = reader.marker();

	let target_type = reader.read_u8()?;
	match target_type {
		// type_parameter_target
		0x00 | 0x01 => reader.skip(1)?,
		// supertype_target
		0x10 => reader.skip(2)?,
		// type_parameter_bound_target
		0x11 | 0x12 => reader.skip(2)?,
		// empty_target
		0x13..=0x15 => {},
		// formal_parameter_target
		0x16 => reader.skip(1)?,
		// throws_target
		0x17 => reader.skip(2)?,
		// localvar_target
		0x40 | 0x41 => {
			let table_length = reader.read_u16_as_usize()?;
			reader.skip(table_length * 6)?;
		},
		// catch_target
		0x42 => reader.skip(2)?,
		// offset_target
		0x43..=0x46 => reader.skip(2)?,
		// type_argument_target
		0x47..=0x4b => reader.skip(3)?,
		target_type => bail!("unknown type annotation target type {target_type:#x}"),
	}

	// type_path
	let path_length = reader.read_u8_as_usize()?;
	reader.skip(path_length * 2)?;

	let end = reader.marker();
	let target = reader.with_pos(start, |r| r.read_slice(end - start))?;

	let annotation = read_annotation(reader)
		.with_context(|| anyhow!("failed to read the annotation of a type annotation target {target_type:#x}"))?;

	Ok(TypeAnnotation { target, annotation })
}

pub(crate) fn write_type_annotation(sink: &mut Vec<u8>, type_annotation: &TypeAnnotation) -> Result<()> {
	sink.write_u8_slice(&type_annotation.target)?;
	write_annotation(sink, &type_annotation.annotation)
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use bytes::Bytes;
	use pretty_assertions::assert_eq;
	use crate::ByteCursor;
	use crate::attribute::annotation::{read_annotation, read_type_annotation, write_annotation, ElementValue};

	#[test]
	fn annotations_round_trip() -> Result<()> {
		let bytes = [
			0x00, 0x01, // type descriptor
			0x00, 0x02, // two pairs
			0x00, 0x03, b'I', 0x00, 0x04,
			0x00, 0x05, b'[', 0x00, 0x01, b's', 0x00, 0x06,
		];
		let annotation = read_annotation(&mut ByteCursor::new(Bytes::copy_from_slice(&bytes)))?;
		assert_eq!(annotation.pairs.len(), 2);
		assert!(matches!(annotation.pairs[1].value, ElementValue::Array(_)));

		let mut sink = Vec::new();
		write_annotation(&mut sink, &annotation)?;
		assert_eq!(sink, bytes);
		Ok(())
	}

	#[test]
	fn type_annotation_targets_stay_raw() -> Result<()> {
		let bytes = [
			0x43, 0x00, 0x10, // offset_target at bytecode offset 16
			0x00,             // empty type_path
			0x00, 0x01,       // type descriptor
			0x00, 0x00,       // no pairs
		];
		let type_annotation = read_type_annotation(&mut ByteCursor::new(Bytes::copy_from_slice(&bytes)))?;
		assert_eq!(&type_annotation.target[..], &bytes[..4]);
		assert_eq!(type_annotation.annotation.type_descriptor.slot(), 1);
		Ok(())
	}

	#[test]
	fn unknown_target_types_are_rejected() {
		let bytes = [0x99, 0x00, 0x00, 0x00, 0x00];
		assert!(read_type_annotation(&mut ByteCursor::new(Bytes::copy_from_slice(&bytes))).is_err());
	}
}
