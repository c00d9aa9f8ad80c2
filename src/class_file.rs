//! The top-level class file container.
//!
//! Decoding is strictly sequential (the constant pool's entries are
//! variable-length, there is no seeking past them) and validates the
//! structural envelope in one pass, but it does not materialize anything it
//! doesn't have to: fields, methods and attributes are kept as byte regions
//! plus their declared counts, and enumerating them re-walks the region with
//! a fresh cursor each time. A decoded [`ClassFile`] is immutable, so any
//! number of threads can enumerate it at once.

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use crate::{ByteCursor, ClassRead};
use crate::attribute::Attribute;
use crate::class_constants;
use crate::error::ClassError;
use crate::pool::{ConstantHandle, ConstantKind, ConstantPool};
use crate::version::Version;

/// Skips the `attributes_count` and `attributes` items of a field, method or
/// class, validating their lengths against the available bytes.
fn skip_attributes(reader: &mut ByteCursor) -> Result<()> {
	let attributes_count = reader.read_u16()?;

	for _ in 0..attributes_count {
		let _attribute_name_index = reader.read_u16()?;
		let attribute_length = reader.read_u32_as_usize()?;

		reader.skip(attribute_length)?;
	}

	Ok(())
}

pub(crate) fn read(data: Bytes) -> Result<ClassFile> {
	if data.len() < 8 {
		return Err(anyhow!(ClassError::MalformedHeader(format!(
			"the stream is {} bytes, shorter than the fixed 8-byte header", data.len()
		))));
	}

	let mut reader = ByteCursor::new(data);

	let magic = reader.read_u32()?;
	if magic != class_constants::MAGIC {
		return Err(anyhow!(ClassError::MalformedHeader(format!(
			"wrong magic: got {magic:#x}, expected 0xCAFEBABE"
		))));
	}

	let minor = reader.read_u16()?;
	let major = reader.read_u16()?;
	let version = Version::new(major, minor);

	if version > Version::V23 {
		bail!("unsupported class file version: {version:?}");
	}

	let pool = ConstantPool::from_reader(&mut reader, version)?;

	let access_flags = reader.read_u16()?;
	let this_class = ConstantHandle::new(reader.read_u16()?, ConstantKind::Class);
	let super_class = optional_class(reader.read_u16()?);
	let interfaces = reader.read_vec(
		|r| r.read_u16_as_usize(),
		|r| Ok(ConstantHandle::new(r.read_u16()?, ConstantKind::Class)),
	)?;

	let fields = MemberTable::read(&mut reader)?;
	let methods = MemberTable::read(&mut reader)?;
	let attributes = AttributeTable::read(&mut reader)?;

	// trailing bytes are left alone, class files may be concatenated

	log::trace!(
		"read a class file: version {}.{}, {} fields, {} methods, {} attributes",
		version.major, version.minor, fields.count, methods.count, attributes.count,
	);

	Ok(ClassFile {
		version,
		pool,
		access_flags,
		this_class,
		super_class,
		interfaces,
		fields,
		methods,
		attributes,
	})
}

fn optional_class(slot: u16) -> ConstantHandle {
	if slot == 0 {
		ConstantHandle::nil()
	} else {
		ConstantHandle::new(slot, ConstantKind::Class)
	}
}

/// A decoded class file.
///
/// Owns its [`ConstantPool`] and the byte region everything else is a view
/// of. The field, method and attribute collections are computed on demand
/// and can be enumerated repeatedly; every enumeration carries its own
/// cursor.
#[derive(Debug)]
pub struct ClassFile {
	version: Version,
	pool: ConstantPool,
	access_flags: u16,
	this_class: ConstantHandle,
	super_class: ConstantHandle,
	interfaces: Vec<ConstantHandle>,
	fields: MemberTable,
	methods: MemberTable,
	attributes: AttributeTable,
}

impl ClassFile {
	pub fn version(&self) -> Version {
		self.version
	}

	pub fn pool(&self) -> &ConstantPool {
		&self.pool
	}

	pub fn access_flags(&self) -> u16 {
		self.access_flags
	}

	/// The `Class` handle of this class itself.
	pub fn this_class(&self) -> ConstantHandle {
		self.this_class
	}

	/// The `Class` handle of the super class; nil for `java/lang/Object`
	/// (and module-info).
	pub fn super_class(&self) -> ConstantHandle {
		self.super_class
	}

	/// The direct superinterfaces, in declaration order.
	pub fn interfaces(&self) -> &[ConstantHandle] {
		&self.interfaces
	}

	pub fn field_count(&self) -> u16 {
		self.fields.count
	}

	pub fn method_count(&self) -> u16 {
		self.methods.count
	}

	pub fn attribute_count(&self) -> u16 {
		self.attributes.count
	}

	/// Enumerates the fields. Restartable: each call walks the stored
	/// region from its start.
	pub fn fields(&self) -> Fields {
		Fields { cursor: self.fields.cursor(), remaining: self.fields.count }
	}

	/// Enumerates the methods. Restartable like [`ClassFile::fields`].
	pub fn methods(&self) -> Methods {
		Methods { cursor: self.methods.cursor(), remaining: self.methods.count }
	}

	/// Enumerates the class-level attributes.
	pub fn attributes(&self) -> Attributes {
		self.attributes.iter()
	}
}

/// The raw bytes of a run of field or method records, plus their count.
#[derive(Debug)]
struct MemberTable {
	region: Bytes,
	count: u16,
}

impl MemberTable {
	/// Reads past a member list, remembering where it was.
	fn read(reader: &mut ByteCursor) -> Result<MemberTable> {
		let count = reader.read_u16()?;
		let start = reader.marker();

		for _ in 0..count {
			// access flags, name, descriptor
			reader.skip(2 + 2 + 2)?;
			skip_attributes(reader)?;
		}

		let end = reader.marker();
		let region = reader.with_pos(start, |r| r.read_slice(end - start))?;
		Ok(MemberTable { region, count })
	}

	fn cursor(&self) -> ByteCursor {
		ByteCursor::new(self.region.clone())
	}
}

/// The raw bytes of a run of attribute records, plus their count.
#[derive(Debug, Clone)]
pub struct AttributeTable {
	region: Bytes,
	count: u16,
}

impl AttributeTable {
	fn read(reader: &mut ByteCursor) -> Result<AttributeTable> {
		let count = reader.read_u16()?;
		let start = reader.marker();

		for _ in 0..count {
			let _attribute_name_index = reader.read_u16()?;
			let attribute_length = reader.read_u32_as_usize()?;
			reader.skip(attribute_length)?;
		}

		let end = reader.marker();
		let region = reader.with_pos(start, |r| r.read_slice(end - start))?;
		Ok(AttributeTable { region, count })
	}

	pub fn count(&self) -> u16 {
		self.count
	}

	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	/// Enumerates the attributes. Restartable.
	pub fn iter(&self) -> Attributes {
		Attributes { cursor: ByteCursor::new(self.region.clone()), remaining: self.count }
	}
}

/// A field of a class.
///
/// Identity within a class is the (name, descriptor) pair, and that is what
/// equality compares.
#[derive(Debug, Clone)]
pub struct Field {
	pub access_flags: u16,
	/// A `Utf8` handle holding the field's name.
	pub name: ConstantHandle,
	/// A `Utf8` handle holding the field's descriptor.
	pub descriptor: ConstantHandle,
	pub attributes: AttributeTable,
}

impl PartialEq for Field {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.descriptor == other.descriptor
	}
}

/// A method of a class. Equality works like [`Field`]'s.
#[derive(Debug, Clone)]
pub struct Method {
	pub access_flags: u16,
	/// A `Utf8` handle holding the method's name.
	pub name: ConstantHandle,
	/// A `Utf8` handle holding the method's descriptor.
	pub descriptor: ConstantHandle,
	pub attributes: AttributeTable,
}

impl PartialEq for Method {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.descriptor == other.descriptor
	}
}

fn read_member(cursor: &mut ByteCursor) -> Result<(u16, ConstantHandle, ConstantHandle, AttributeTable)> {
	let access_flags = cursor.read_u16()?;
	let name = ConstantHandle::new(cursor.read_u16()?, ConstantKind::Utf8);
	let descriptor = ConstantHandle::new(cursor.read_u16()?, ConstantKind::Utf8);
	let attributes = AttributeTable::read(cursor)?;
	Ok((access_flags, name, descriptor, attributes))
}

/// Iterator over a class's fields. Stops after the first error.
#[derive(Debug)]
pub struct Fields {
	cursor: ByteCursor,
	remaining: u16,
}

impl Iterator for Fields {
	type Item = Result<Field>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}
		self.remaining -= 1;

		match read_member(&mut self.cursor) {
			Ok((access_flags, name, descriptor, attributes)) => {
				Some(Ok(Field { access_flags, name, descriptor, attributes }))
			},
			Err(e) => {
				self.remaining = 0;
				Some(Err(e))
			},
		}
	}
}

/// Iterator over a class's methods. Stops after the first error.
#[derive(Debug)]
pub struct Methods {
	cursor: ByteCursor,
	remaining: u16,
}

impl Iterator for Methods {
	type Item = Result<Method>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}
		self.remaining -= 1;

		match read_member(&mut self.cursor) {
			Ok((access_flags, name, descriptor, attributes)) => {
				Some(Ok(Method { access_flags, name, descriptor, attributes }))
			},
			Err(e) => {
				self.remaining = 0;
				Some(Err(e))
			},
		}
	}
}

/// Iterator over an attribute table. Stops after the first error.
#[derive(Debug)]
pub struct Attributes {
	cursor: ByteCursor,
	remaining: u16,
}

impl Iterator for Attributes {
	type Item = Result<Attribute>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}
		self.remaining -= 1;

		match Attribute::read(&mut self.cursor) {
			Ok(attribute) => Some(Ok(attribute)),
			Err(e) => {
				self.remaining = 0;
				Some(Err(e))
			},
		}
	}
}

#[cfg(test)]
mod testing {
	use crate::class_file::ClassFile;

	#[test]
	fn decoded_classes_are_shareable_across_threads() {
		fn assert_send_sync<T: Send + Sync>() {}
		assert_send_sync::<ClassFile>();
	}
}
