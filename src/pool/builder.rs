//! Building constant pools, and the policy seam for cross-pool copying.

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use java_string::{JavaStr, JavaString};
use crate::{jstring, ClassWrite};
use crate::pool::{ConstantData, ConstantHandle, ConstantKind, ConstantPool, RawConstant};
use crate::version::Version;

/// The policy that decides what "the equivalent constant" means when
/// something is copied from one pool context into another.
///
/// Every constant-referencing operand that gets relocated is put through
/// [`ConstantResolver::resolve`]; the returned handle is used verbatim in the
/// re-emitted bytes. The copy machinery asks at most once per distinct source
/// slot and reuses the answer.
///
/// [`PoolBuilder`] is the provided implementation (structural reuse: insert
/// if absent). A host that wants always-insert, or that maps into an already
/// laid out pool, supplies its own.
pub trait ConstantResolver {
	/// Returns the handle that, in the destination pool, denotes a constant
	/// of equivalent kind and value to `handle`'s referent in `source`.
	fn resolve(&mut self, source: &ConstantPool, handle: ConstantHandle) -> Result<ConstantHandle>;
}

/// One entry of a pool under construction. Index fields refer to slots
/// already handed out by the same builder, so structural equality of entries
/// is equality of the constants they denote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolEntry {
	Utf8(JavaString),
	Integer(i32),
	/// Bits, so that `NaN`s compare and hash consistently.
	Float(u32),
	Long(i64),
	/// Bits, same reason as `Float`.
	Double(u64),
	Class { name_index: u16 },
	String { string_index: u16 },
	FieldRef { class_index: u16, name_and_type_index: u16 },
	MethodRef { class_index: u16, name_and_type_index: u16 },
	InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
	NameAndType { name_index: u16, descriptor_index: u16 },
	MethodHandle { reference_kind: u8, reference_index: u16 },
	MethodType { descriptor_index: u16 },
	Dynamic { bootstrap_method_attribute_index: u16, name_and_type_index: u16 },
	InvokeDynamic { bootstrap_method_attribute_index: u16, name_and_type_index: u16 },
	Module { name_index: u16 },
	Package { name_index: u16 },
}

impl PoolEntry {
	fn kind(&self) -> ConstantKind {
		match self {
			PoolEntry::Utf8(_) => ConstantKind::Utf8,
			PoolEntry::Integer(_) => ConstantKind::Integer,
			PoolEntry::Float(_) => ConstantKind::Float,
			PoolEntry::Long(_) => ConstantKind::Long,
			PoolEntry::Double(_) => ConstantKind::Double,
			PoolEntry::Class { .. } => ConstantKind::Class,
			PoolEntry::String { .. } => ConstantKind::String,
			PoolEntry::FieldRef { .. } => ConstantKind::FieldRef,
			PoolEntry::MethodRef { .. } => ConstantKind::MethodRef,
			PoolEntry::InterfaceMethodRef { .. } => ConstantKind::InterfaceMethodRef,
			PoolEntry::NameAndType { .. } => ConstantKind::NameAndType,
			PoolEntry::MethodHandle { .. } => ConstantKind::MethodHandle,
			PoolEntry::MethodType { .. } => ConstantKind::MethodType,
			PoolEntry::Dynamic { .. } => ConstantKind::Dynamic,
			PoolEntry::InvokeDynamic { .. } => ConstantKind::InvokeDynamic,
			PoolEntry::Module { .. } => ConstantKind::Module,
			PoolEntry::Package { .. } => ConstantKind::Package,
		}
	}

	/// The entry body exactly as stored after the tag byte.
	fn body(&self) -> Vec<u8> {
		match self {
			PoolEntry::Utf8(string) => {
				let bytes = jstring::from_string_to_vec(string);
				let mut vec = Vec::with_capacity(2 + bytes.len());
				vec.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
				vec.extend_from_slice(&bytes);
				vec
			},
			PoolEntry::Integer(value) => value.to_be_bytes().to_vec(),
			PoolEntry::Float(bits) => bits.to_be_bytes().to_vec(),
			PoolEntry::Long(value) => value.to_be_bytes().to_vec(),
			PoolEntry::Double(bits) => bits.to_be_bytes().to_vec(),
			PoolEntry::Class { name_index } |
			PoolEntry::Module { name_index } |
			PoolEntry::Package { name_index } => name_index.to_be_bytes().to_vec(),
			PoolEntry::String { string_index } => string_index.to_be_bytes().to_vec(),
			PoolEntry::MethodType { descriptor_index } => descriptor_index.to_be_bytes().to_vec(),
			PoolEntry::FieldRef { class_index: a, name_and_type_index: b } |
			PoolEntry::MethodRef { class_index: a, name_and_type_index: b } |
			PoolEntry::InterfaceMethodRef { class_index: a, name_and_type_index: b } |
			PoolEntry::NameAndType { name_index: a, descriptor_index: b } |
			PoolEntry::Dynamic { bootstrap_method_attribute_index: a, name_and_type_index: b } |
			PoolEntry::InvokeDynamic { bootstrap_method_attribute_index: a, name_and_type_index: b } => {
				let mut vec = Vec::with_capacity(4);
				vec.extend_from_slice(&a.to_be_bytes());
				vec.extend_from_slice(&b.to_be_bytes());
				vec
			},
			PoolEntry::MethodHandle { reference_kind, reference_index } => {
				let mut vec = Vec::with_capacity(3);
				vec.push(*reference_kind);
				vec.extend_from_slice(&reference_index.to_be_bytes());
				vec
			},
		}
	}
}

/// A constant pool under construction: insertion-ordered, structurally
/// deduplicating, aware of the two slots a `Long` or `Double` takes.
///
/// Putting an entry that is already present returns the slot it got the
/// first time.
#[derive(Debug)]
pub struct PoolBuilder {
	/// The value written as `constant_pool_count`. Starts at 1 (the first
	/// slot handed out) and grows by two for `Long` and `Double`.
	count: u16,
	/// Entry to slot, in insertion order. Slots can skip ahead of the map
	/// position because of two-slot entries.
	entries: IndexMap<PoolEntry, u16>,
}

impl PoolBuilder {
	pub fn new() -> PoolBuilder {
		PoolBuilder { count: 1, entries: IndexMap::new() }
	}

	/// The value the `constant_pool_count` item would have right now.
	pub fn count(&self) -> u16 {
		self.count
	}

	fn put(&mut self, entry: PoolEntry) -> Result<ConstantHandle> {
		let kind = entry.kind();
		if let Some(&slot) = self.entries.get(&entry) {
			return Ok(ConstantHandle::new(slot, kind));
		}

		let slot = self.count;
		let inc = if kind.is_two_slots() { 2 } else { 1 };
		self.count = self.count.checked_add(inc)
			.with_context(|| anyhow!("pool count overflowed while adding {entry:?} at slot {slot}"))?;

		self.entries.insert(entry, slot);
		Ok(ConstantHandle::new(slot, kind))
	}

	pub fn put_utf8(&mut self, value: &JavaStr) -> Result<ConstantHandle> {
		if jstring::from_string_to_vec(value).len() > u16::MAX as usize {
			bail!("utf8 constant is too long: the encoded form must fit in an u16 length");
		}
		self.put(PoolEntry::Utf8(value.to_owned()))
	}

	pub fn put_integer(&mut self, value: i32) -> Result<ConstantHandle> {
		self.put(PoolEntry::Integer(value))
	}

	pub fn put_float(&mut self, value: f32) -> Result<ConstantHandle> {
		self.put(PoolEntry::Float(value.to_bits()))
	}

	pub fn put_long(&mut self, value: i64) -> Result<ConstantHandle> {
		self.put(PoolEntry::Long(value))
	}

	pub fn put_double(&mut self, value: f64) -> Result<ConstantHandle> {
		self.put(PoolEntry::Double(value.to_bits()))
	}

	pub fn put_class(&mut self, name: &JavaStr) -> Result<ConstantHandle> {
		let name_index = self.put_utf8(name)?.slot();
		self.put(PoolEntry::Class { name_index })
	}

	pub fn put_string(&mut self, value: &JavaStr) -> Result<ConstantHandle> {
		let string_index = self.put_utf8(value)?.slot();
		self.put(PoolEntry::String { string_index })
	}

	pub fn put_name_and_type(&mut self, name: &JavaStr, descriptor: &JavaStr) -> Result<ConstantHandle> {
		let name_index = self.put_utf8(name)?.slot();
		let descriptor_index = self.put_utf8(descriptor)?.slot();
		self.put(PoolEntry::NameAndType { name_index, descriptor_index })
	}

	pub fn put_field_ref(&mut self, class: &JavaStr, name: &JavaStr, descriptor: &JavaStr) -> Result<ConstantHandle> {
		let class_index = self.put_class(class)?.slot();
		let name_and_type_index = self.put_name_and_type(name, descriptor)?.slot();
		self.put(PoolEntry::FieldRef { class_index, name_and_type_index })
	}

	pub fn put_method_ref(&mut self, class: &JavaStr, name: &JavaStr, descriptor: &JavaStr) -> Result<ConstantHandle> {
		let class_index = self.put_class(class)?.slot();
		let name_and_type_index = self.put_name_and_type(name, descriptor)?.slot();
		self.put(PoolEntry::MethodRef { class_index, name_and_type_index })
	}

	pub fn put_interface_method_ref(&mut self, class: &JavaStr, name: &JavaStr, descriptor: &JavaStr) -> Result<ConstantHandle> {
		let class_index = self.put_class(class)?.slot();
		let name_and_type_index = self.put_name_and_type(name, descriptor)?.slot();
		self.put(PoolEntry::InterfaceMethodRef { class_index, name_and_type_index })
	}

	/// Copies the constant `handle` references in `source` into this pool,
	/// structurally, nested references included.
	///
	/// `Dynamic` and `InvokeDynamic` entries keep their bootstrap method
	/// index verbatim; aligning the `BootstrapMethods` attribute of the
	/// destination class is up to the host.
	pub fn insert_from(&mut self, source: &ConstantPool, handle: ConstantHandle) -> Result<ConstantHandle> {
		let data = source.read(handle)
			.with_context(|| anyhow!("can't copy pool slot {} across pools", handle.slot()))?;

		let entry = match data {
			ConstantData::Utf8(string) => PoolEntry::Utf8(string),
			ConstantData::Integer(value) => PoolEntry::Integer(value),
			ConstantData::Float(value) => PoolEntry::Float(value.to_bits()),
			ConstantData::Long(value) => PoolEntry::Long(value),
			ConstantData::Double(value) => PoolEntry::Double(value.to_bits()),
			ConstantData::Class { name } => PoolEntry::Class {
				name_index: self.insert_from(source, name)?.slot(),
			},
			ConstantData::String { value } => PoolEntry::String {
				string_index: self.insert_from(source, value)?.slot(),
			},
			ConstantData::FieldRef { class, name_and_type } => PoolEntry::FieldRef {
				class_index: self.insert_from(source, class)?.slot(),
				name_and_type_index: self.insert_from(source, name_and_type)?.slot(),
			},
			ConstantData::MethodRef { class, name_and_type } => PoolEntry::MethodRef {
				class_index: self.insert_from(source, class)?.slot(),
				name_and_type_index: self.insert_from(source, name_and_type)?.slot(),
			},
			ConstantData::InterfaceMethodRef { class, name_and_type } => PoolEntry::InterfaceMethodRef {
				class_index: self.insert_from(source, class)?.slot(),
				name_and_type_index: self.insert_from(source, name_and_type)?.slot(),
			},
			ConstantData::NameAndType { name, descriptor } => PoolEntry::NameAndType {
				name_index: self.insert_from(source, name)?.slot(),
				descriptor_index: self.insert_from(source, descriptor)?.slot(),
			},
			ConstantData::MethodHandle { reference_kind, reference } => PoolEntry::MethodHandle {
				reference_kind,
				reference_index: self.insert_from(source, reference)?.slot(),
			},
			ConstantData::MethodType { descriptor } => PoolEntry::MethodType {
				descriptor_index: self.insert_from(source, descriptor)?.slot(),
			},
			ConstantData::Dynamic { bootstrap_method_index, name_and_type } => PoolEntry::Dynamic {
				bootstrap_method_attribute_index: bootstrap_method_index,
				name_and_type_index: self.insert_from(source, name_and_type)?.slot(),
			},
			ConstantData::InvokeDynamic { bootstrap_method_index, name_and_type } => PoolEntry::InvokeDynamic {
				bootstrap_method_attribute_index: bootstrap_method_index,
				name_and_type_index: self.insert_from(source, name_and_type)?.slot(),
			},
			ConstantData::Module { name } => PoolEntry::Module {
				name_index: self.insert_from(source, name)?.slot(),
			},
			ConstantData::Package { name } => PoolEntry::Package {
				name_index: self.insert_from(source, name)?.slot(),
			},
		};
		self.put(entry)
	}

	/// Writes the pool: the count, then every entry in insertion order.
	pub fn write(&self, sink: &mut Vec<u8>) -> Result<()> {
		sink.write_u16(self.count())?;
		for (entry, _) in &self.entries {
			let tag = entry.kind().to_tag();
			// every constructible entry has a tag
			let Some(tag) = tag else { bail!("can't write entry {entry:?}") };
			sink.write_u8(tag)?;
			sink.write_u8_slice(&entry.body())?;
		}
		Ok(())
	}

	/// Freezes this builder into a readable [`ConstantPool`].
	pub fn into_pool(self, version: Version) -> ConstantPool {
		let records = self.entries.into_iter().map(|(entry, _)| RawConstant {
			kind: entry.kind(),
			data: entry.body().into(),
		});
		ConstantPool::from_records(version, records)
	}
}

impl Default for PoolBuilder {
	fn default() -> PoolBuilder {
		PoolBuilder::new()
	}
}

impl ConstantResolver for PoolBuilder {
	fn resolve(&mut self, source: &ConstantPool, handle: ConstantHandle) -> Result<ConstantHandle> {
		self.insert_from(source, handle)
	}
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use java_string::JavaStr;
	use pretty_assertions::assert_eq;
	use crate::ByteCursor;
	use crate::pool::{ConstantHandle, ConstantKind, ConstantPool, PoolBuilder};
	use crate::version::Version;

	#[test]
	fn entries_are_deduplicated() -> Result<()> {
		let mut pool = PoolBuilder::new();
		let a = pool.put_utf8(JavaStr::from_str("foo"))?;
		let b = pool.put_utf8(JavaStr::from_str("foo"))?;
		assert_eq!(a, b);
		assert_eq!(pool.count(), 2);
		Ok(())
	}

	#[test]
	fn two_slot_entries_skip_a_slot() -> Result<()> {
		let mut pool = PoolBuilder::new();
		assert_eq!(pool.put_long(1)?.slot(), 1);
		assert_eq!(pool.put_integer(2)?.slot(), 3);
		assert_eq!(pool.count(), 4);
		Ok(())
	}

	#[test]
	fn nested_references_come_first() -> Result<()> {
		let mut pool = PoolBuilder::new();
		let field = pool.put_field_ref(
			JavaStr::from_str("org/example/Main"),
			JavaStr::from_str("counter"),
			JavaStr::from_str("I"),
		)?;
		assert_eq!(field.kind(), ConstantKind::FieldRef);

		// freezing and re-reading resolves back to the same strings
		let frozen = pool.into_pool(Version::V1_8);
		let crate::pool::ConstantData::FieldRef { class, name_and_type } = frozen.read(field)? else {
			panic!("not a field ref");
		};
		assert_eq!(frozen.get_class_name(class)?, JavaStr::from_str("org/example/Main"));
		assert_eq!(frozen.get_name_and_type(name_and_type)?.0, JavaStr::from_str("counter"));
		assert_eq!(frozen.get_name_and_type(name_and_type)?.1, JavaStr::from_str("I"));
		Ok(())
	}

	#[test]
	fn written_pools_read_back() -> Result<()> {
		let mut pool = PoolBuilder::new();
		let class = pool.put_class(JavaStr::from_str("org/example/Main"))?;
		let value = pool.put_long(1i64 << 40)?;

		let mut sink = Vec::new();
		pool.write(&mut sink)?;

		let read = ConstantPool::from_reader(&mut ByteCursor::new(sink.into()), Version::V1_8)?;
		assert_eq!(read.get_class_name(class)?, JavaStr::from_str("org/example/Main"));
		assert_eq!(read.get_long(value)?, 1i64 << 40);
		Ok(())
	}

	#[test]
	fn freezing_keeps_slots() -> Result<()> {
		let mut pool = PoolBuilder::new();
		let value = pool.put_integer(1234)?;
		let frozen = pool.into_pool(Version::V1_8);
		assert_eq!(frozen.get_integer(ConstantHandle::new(value.slot(), ConstantKind::Integer))?, 1234);
		Ok(())
	}
}
