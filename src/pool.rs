//! The constant pool: raw, 1-indexed constant records and the kind-tagged
//! handles that reference them.
//!
//! Entries are kept as `(kind, raw bytes)` pairs. Resolution is two-tiered:
//! [`ConstantPool::get`] hands out a cheap [`ConstantView`] for any in-range
//! slot no matter its kind, and [`ConstantPool::read`] fully decodes a slot,
//! failing with [`ClassError::InvalidReference`](crate::ClassError) when the
//! stored kind disagrees with what the handle declared.
//!
//! `Long` and `Double` entries occupy two consecutive slots; the slot after
//! them, like slot zero, is reserved and enumerates as [`ConstantKind::Unknown`].

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use java_string::JavaString;
use crate::{jstring, ByteCursor, ClassRead, ClassWrite};
use crate::class_constants::pool::{self as tag, method_handle_reference};
use crate::error::ClassError;
use crate::version::Version;

mod builder;
pub use builder::{ConstantResolver, PoolBuilder};

/// The kind of a constant pool entry.
///
/// [`ConstantKind::Unknown`] is the kind of the reserved slots (slot zero and
/// the upper halves of `Long`/`Double`), and also the declared kind of
/// handles whose referent the context doesn't constrain (the `ldc` operand).
/// Consumers must not interpret `Unknown` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantKind {
	Utf8,
	Integer,
	Float,
	Long,
	Double,
	Class,
	String,
	FieldRef,
	MethodRef,
	InterfaceMethodRef,
	NameAndType,
	MethodHandle,
	MethodType,
	Dynamic,
	InvokeDynamic,
	Module,
	Package,
	Unknown,
}

impl ConstantKind {
	pub(crate) fn from_tag(value: u8) -> Option<ConstantKind> {
		Some(match value {
			tag::UTF8 => ConstantKind::Utf8,
			tag::INTEGER => ConstantKind::Integer,
			tag::FLOAT => ConstantKind::Float,
			tag::LONG => ConstantKind::Long,
			tag::DOUBLE => ConstantKind::Double,
			tag::CLASS => ConstantKind::Class,
			tag::STRING => ConstantKind::String,
			tag::FIELD_REF => ConstantKind::FieldRef,
			tag::METHOD_REF => ConstantKind::MethodRef,
			tag::INTERFACE_METHOD_REF => ConstantKind::InterfaceMethodRef,
			tag::NAME_AND_TYPE => ConstantKind::NameAndType,
			tag::METHOD_HANDLE => ConstantKind::MethodHandle,
			tag::METHOD_TYPE => ConstantKind::MethodType,
			tag::DYNAMIC => ConstantKind::Dynamic,
			tag::INVOKE_DYNAMIC => ConstantKind::InvokeDynamic,
			tag::MODULE => ConstantKind::Module,
			tag::PACKAGE => ConstantKind::Package,
			_ => return None,
		})
	}

	pub(crate) fn to_tag(self) -> Option<u8> {
		Some(match self {
			ConstantKind::Utf8 => tag::UTF8,
			ConstantKind::Integer => tag::INTEGER,
			ConstantKind::Float => tag::FLOAT,
			ConstantKind::Long => tag::LONG,
			ConstantKind::Double => tag::DOUBLE,
			ConstantKind::Class => tag::CLASS,
			ConstantKind::String => tag::STRING,
			ConstantKind::FieldRef => tag::FIELD_REF,
			ConstantKind::MethodRef => tag::METHOD_REF,
			ConstantKind::InterfaceMethodRef => tag::INTERFACE_METHOD_REF,
			ConstantKind::NameAndType => tag::NAME_AND_TYPE,
			ConstantKind::MethodHandle => tag::METHOD_HANDLE,
			ConstantKind::MethodType => tag::METHOD_TYPE,
			ConstantKind::Dynamic => tag::DYNAMIC,
			ConstantKind::InvokeDynamic => tag::INVOKE_DYNAMIC,
			ConstantKind::Module => tag::MODULE,
			ConstantKind::Package => tag::PACKAGE,
			ConstantKind::Unknown => return None,
		})
	}

	/// `Long` and `Double` take up two pool slots.
	pub(crate) fn is_two_slots(self) -> bool {
		matches!(self, ConstantKind::Long | ConstantKind::Double)
	}
}

/// A 1-based slot index into a [`ConstantPool`], tagged with the kind of
/// constant the context declares it to reference.
///
/// Slot zero is the nil handle, meaning "absent" (no super class, catch-all
/// exception handler).
///
/// The kind is a view, not part of the identity: equality and hashing only
/// consider the slot, so a handle can be re-tagged with [`ConstantHandle::expecting`]
/// without becoming a different reference. Whether the declared kind actually
/// matches the stored one is checked at [`ConstantPool::read`] time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantHandle {
	slot: u16,
	kind: ConstantKind,
}

impl ConstantHandle {
	pub const fn new(slot: u16, kind: ConstantKind) -> ConstantHandle {
		ConstantHandle { slot, kind }
	}

	pub const fn nil() -> ConstantHandle {
		ConstantHandle { slot: 0, kind: ConstantKind::Unknown }
	}

	pub fn is_nil(self) -> bool {
		self.slot == 0
	}

	pub fn slot(self) -> u16 {
		self.slot
	}

	pub fn kind(self) -> ConstantKind {
		self.kind
	}

	/// Reinterprets this handle as referencing a constant of `kind`.
	///
	/// This is how a handle is narrowed (or widened back to
	/// [`ConstantKind::Unknown`]); it is checked, but only once the handle is
	/// actually [read](ConstantPool::read).
	pub fn expecting(self, kind: ConstantKind) -> ConstantHandle {
		ConstantHandle { slot: self.slot, kind }
	}
}

impl PartialEq for ConstantHandle {
	fn eq(&self, other: &Self) -> bool {
		self.slot == other.slot
	}
}
impl Eq for ConstantHandle {}
impl std::hash::Hash for ConstantHandle {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.slot.hash(state);
	}
}

/// One raw constant record: its kind and its body bytes exactly as stored
/// after the tag (for `Utf8` this includes the two length bytes).
#[derive(Debug, Clone, PartialEq)]
pub struct RawConstant {
	pub kind: ConstantKind,
	pub data: Bytes,
}

impl RawConstant {
	fn reserved() -> RawConstant {
		RawConstant { kind: ConstantKind::Unknown, data: Bytes::new() }
	}
}

/// A cheap, undecoded look at one pool slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantView<'a> {
	pub slot: u16,
	pub kind: ConstantKind,
	pub data: &'a [u8],
}

impl ConstantView<'_> {
	pub fn handle(&self) -> ConstantHandle {
		ConstantHandle::new(self.slot, self.kind)
	}
}

/// A fully decoded constant. References to other constants stay handles;
/// resolving those is again up to the caller, which keeps decoding lazy.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantData {
	Utf8(JavaString),
	Integer(i32),
	Float(f32),
	Long(i64),
	Double(f64),
	Class { name: ConstantHandle },
	String { value: ConstantHandle },
	FieldRef { class: ConstantHandle, name_and_type: ConstantHandle },
	MethodRef { class: ConstantHandle, name_and_type: ConstantHandle },
	InterfaceMethodRef { class: ConstantHandle, name_and_type: ConstantHandle },
	NameAndType { name: ConstantHandle, descriptor: ConstantHandle },
	MethodHandle { reference_kind: u8, reference: ConstantHandle },
	MethodType { descriptor: ConstantHandle },
	Dynamic { bootstrap_method_index: u16, name_and_type: ConstantHandle },
	InvokeDynamic { bootstrap_method_index: u16, name_and_type: ConstantHandle },
	Module { name: ConstantHandle },
	Package { name: ConstantHandle },
}

impl ConstantData {
	pub fn kind(&self) -> ConstantKind {
		match self {
			ConstantData::Utf8(_) => ConstantKind::Utf8,
			ConstantData::Integer(_) => ConstantKind::Integer,
			ConstantData::Float(_) => ConstantKind::Float,
			ConstantData::Long(_) => ConstantKind::Long,
			ConstantData::Double(_) => ConstantKind::Double,
			ConstantData::Class { .. } => ConstantKind::Class,
			ConstantData::String { .. } => ConstantKind::String,
			ConstantData::FieldRef { .. } => ConstantKind::FieldRef,
			ConstantData::MethodRef { .. } => ConstantKind::MethodRef,
			ConstantData::InterfaceMethodRef { .. } => ConstantKind::InterfaceMethodRef,
			ConstantData::NameAndType { .. } => ConstantKind::NameAndType,
			ConstantData::MethodHandle { .. } => ConstantKind::MethodHandle,
			ConstantData::MethodType { .. } => ConstantKind::MethodType,
			ConstantData::Dynamic { .. } => ConstantKind::Dynamic,
			ConstantData::InvokeDynamic { .. } => ConstantKind::InvokeDynamic,
			ConstantData::Module { .. } => ConstantKind::Module,
			ConstantData::Package { .. } => ConstantKind::Package,
		}
	}
}

/// The allowed target kinds of a `MethodHandle` entry, keyed by its
/// `reference_kind` and the class file version.
///
/// Before version 52.0, `invokestatic` and `invokespecial` handles may only
/// target `MethodRef` entries; from 52.0 on they may also target interface
/// methods.
fn method_handle_target_kinds(reference_kind: u8, version: Version) -> Result<&'static [ConstantKind]> {
	use method_handle_reference as r;
	Ok(match reference_kind {
		r::GET_FIELD | r::GET_STATIC | r::PUT_FIELD | r::PUT_STATIC => &[ConstantKind::FieldRef],
		r::INVOKE_VIRTUAL | r::NEW_INVOKE_SPECIAL => &[ConstantKind::MethodRef],
		r::INVOKE_STATIC | r::INVOKE_SPECIAL => if version >= Version::V1_8 {
			&[ConstantKind::MethodRef, ConstantKind::InterfaceMethodRef]
		} else {
			&[ConstantKind::MethodRef]
		},
		r::INVOKE_INTERFACE => &[ConstantKind::InterfaceMethodRef],
		_ => bail!("unknown `reference_kind` {reference_kind} for `MethodHandle` pool entry"),
	})
}

/// The constant pool of one class file.
///
/// Owned exclusively by its [`ClassFile`](crate::class_file::ClassFile) (or
/// built standalone for composition and tests); immutable once constructed,
/// so shared reads need no synchronization.
#[derive(Debug)]
pub struct ConstantPool {
	version: Version,
	/// Slot zero and the upper halves of `Long`/`Double` hold reserved
	/// entries of kind [`ConstantKind::Unknown`].
	entries: Vec<RawConstant>,
}

impl ConstantPool {
	/// Reads the constant pool from the reader. The first thing read is the
	/// `u16` constant pool count, then `count - 1` slots worth of entries.
	pub(crate) fn from_reader(reader: &mut ByteCursor, version: Version) -> Result<ConstantPool> {
		let mut entries = vec![RawConstant::reserved()];

		let count = reader.read_u16_as_usize()?;
		while entries.len() < count {
			let tag = reader.read_u8()?;
			let kind = ConstantKind::from_tag(tag)
				.with_context(|| anyhow!("unknown constant pool tag {tag} at pool slot {}", entries.len()))?;

			let size = match kind {
				ConstantKind::Utf8 => {
					let length = reader.with_pos(reader.marker(), |r| r.read_u16_as_usize())?;
					2 + length
				},
				ConstantKind::Integer | ConstantKind::Float => 4,
				ConstantKind::Long | ConstantKind::Double => 8,
				ConstantKind::Class | ConstantKind::String |
				ConstantKind::MethodType | ConstantKind::Module | ConstantKind::Package => 2,
				ConstantKind::FieldRef | ConstantKind::MethodRef | ConstantKind::InterfaceMethodRef |
				ConstantKind::NameAndType | ConstantKind::Dynamic | ConstantKind::InvokeDynamic => 4,
				ConstantKind::MethodHandle => 3,
				ConstantKind::Unknown => unreachable!(),
			};

			let data = reader.read_slice(size)
				.with_context(|| anyhow!("failed to read {kind:?} entry at pool slot {}", entries.len()))?;

			entries.push(RawConstant { kind, data });
			if kind.is_two_slots() {
				entries.push(RawConstant::reserved());
			}
		}
		if entries.len() > count {
			bail!("a two-slot constant at slot {} overflows the declared pool count {count}", entries.len() - 2);
		}

		Ok(ConstantPool { version, entries })
	}

	/// Builds a pool directly from pre-decoded raw records.
	///
	/// The records are the logical entries; the skip slots after `Long` and
	/// `Double` records are inserted here.
	pub fn from_records(version: Version, records: impl IntoIterator<Item = RawConstant>) -> ConstantPool {
		let mut entries = vec![RawConstant::reserved()];
		for record in records {
			let two = record.kind.is_two_slots();
			entries.push(record);
			if two {
				entries.push(RawConstant::reserved());
			}
		}
		ConstantPool { version, entries }
	}

	/// The class file version whose legality rules apply to this pool.
	pub fn version(&self) -> Version {
		self.version
	}

	/// The value of the `constant_pool_count` item: one more than the number
	/// of slots in use.
	pub fn count(&self) -> u16 {
		self.entries.len() as u16
	}

	/// Looks at a slot without interpreting it.
	///
	/// Succeeds for every in-range slot regardless of kind (reserved slots
	/// come back as [`ConstantKind::Unknown`]); only an out-of-range slot is
	/// an [`ClassError::InvalidReference`] error.
	pub fn get(&self, handle: ConstantHandle) -> Result<ConstantView<'_>> {
		let slot = handle.slot();
		match self.entries.get(slot as usize) {
			Some(entry) => Ok(ConstantView { slot, kind: entry.kind, data: &entry.data }),
			None => Err(anyhow!(ClassError::InvalidReference(format!(
				"slot {slot} is out of bounds for a pool of count {}", self.count()
			)))),
		}
	}

	/// Fully decodes a slot.
	///
	/// If the handle declares a kind (anything but [`ConstantKind::Unknown`])
	/// and the stored kind disagrees, this fails with
	/// [`ClassError::InvalidReference`]. Reserved slots can't be read at all.
	pub fn read(&self, handle: ConstantHandle) -> Result<ConstantData> {
		let view = self.get(handle)?;

		if view.kind == ConstantKind::Unknown {
			return Err(anyhow!(ClassError::InvalidReference(format!(
				"slot {} is reserved (slot zero, or the upper half of a `Long` or `Double`)", view.slot
			))));
		}
		if handle.kind() != ConstantKind::Unknown && handle.kind() != view.kind {
			return Err(anyhow!(ClassError::InvalidReference(format!(
				"handle declares {:?}, but slot {} stores {:?}", handle.kind(), view.slot, view.kind
			))));
		}

		self.decode(view)
			.with_context(|| anyhow!("while decoding pool slot {}", view.slot))
	}

	fn decode(&self, view: ConstantView<'_>) -> Result<ConstantData> {
		let mut r = ByteCursor::new(Bytes::copy_from_slice(view.data));
		let data = match view.kind {
			ConstantKind::Utf8 => {
				let length = r.read_u16_as_usize()?;
				let vec = r.read_u8_vec(length)?;
				ConstantData::Utf8(jstring::from_vec_to_string(vec)?)
			},
			ConstantKind::Integer => ConstantData::Integer(r.read_i32()?),
			ConstantKind::Float => ConstantData::Float(f32::from_bits(r.read_u32()?)),
			ConstantKind::Long => ConstantData::Long(r.read_i64()?),
			ConstantKind::Double => ConstantData::Double(f64::from_bits(r.read_u64()?)),
			ConstantKind::Class => ConstantData::Class {
				name: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::String => ConstantData::String {
				value: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::FieldRef => ConstantData::FieldRef {
				class: ConstantHandle::new(r.read_u16()?, ConstantKind::Class),
				name_and_type: ConstantHandle::new(r.read_u16()?, ConstantKind::NameAndType),
			},
			ConstantKind::MethodRef => ConstantData::MethodRef {
				class: ConstantHandle::new(r.read_u16()?, ConstantKind::Class),
				name_and_type: ConstantHandle::new(r.read_u16()?, ConstantKind::NameAndType),
			},
			ConstantKind::InterfaceMethodRef => ConstantData::InterfaceMethodRef {
				class: ConstantHandle::new(r.read_u16()?, ConstantKind::Class),
				name_and_type: ConstantHandle::new(r.read_u16()?, ConstantKind::NameAndType),
			},
			ConstantKind::NameAndType => ConstantData::NameAndType {
				name: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
				descriptor: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::MethodHandle => {
				let reference_kind = r.read_u8()?;
				let reference_slot = r.read_u16()?;

				let allowed = method_handle_target_kinds(reference_kind, self.version)?;
				let stored = self.get(ConstantHandle::new(reference_slot, ConstantKind::Unknown))?.kind;
				if !allowed.contains(&stored) {
					return Err(anyhow!(ClassError::InvalidReference(format!(
						"a `MethodHandle` of reference kind {reference_kind} may target {allowed:?} \
						 in version {:?}, but slot {reference_slot} stores {stored:?}", self.version
					))));
				}

				ConstantData::MethodHandle {
					reference_kind,
					reference: ConstantHandle::new(reference_slot, stored),
				}
			},
			ConstantKind::MethodType => ConstantData::MethodType {
				descriptor: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::Dynamic => ConstantData::Dynamic {
				bootstrap_method_index: r.read_u16()?,
				name_and_type: ConstantHandle::new(r.read_u16()?, ConstantKind::NameAndType),
			},
			ConstantKind::InvokeDynamic => ConstantData::InvokeDynamic {
				bootstrap_method_index: r.read_u16()?,
				name_and_type: ConstantHandle::new(r.read_u16()?, ConstantKind::NameAndType),
			},
			ConstantKind::Module => ConstantData::Module {
				name: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::Package => ConstantData::Package {
				name: ConstantHandle::new(r.read_u16()?, ConstantKind::Utf8),
			},
			ConstantKind::Unknown => unreachable!(),
		};
		Ok(data)
	}

	/// Yields a view of every slot once, in storage order, reserved slots
	/// included.
	pub fn iter(&self) -> impl Iterator<Item = ConstantView<'_>> {
		self.entries.iter().enumerate().map(|(slot, entry)| ConstantView {
			slot: slot as u16,
			kind: entry.kind,
			data: &entry.data,
		})
	}

	/// Returns [`None`] for the nil handle, otherwise the result of `f`.
	pub fn get_optional<'a, T: 'a>(
		&'a self,
		handle: ConstantHandle,
		f: impl FnOnce(&'a ConstantPool, ConstantHandle) -> Result<T>,
	) -> Result<Option<T>> {
		if handle.is_nil() {
			Ok(None)
		} else {
			Ok(Some(f(self, handle)?))
		}
	}

	pub fn get_utf8(&self, handle: ConstantHandle) -> Result<JavaString> {
		match self.read(handle.expecting(ConstantKind::Utf8)).pool_context(handle)? {
			ConstantData::Utf8(string) => Ok(string),
			_ => unreachable!(),
		}
	}

	pub fn get_integer(&self, handle: ConstantHandle) -> Result<i32> {
		match self.read(handle.expecting(ConstantKind::Integer)).pool_context(handle)? {
			ConstantData::Integer(value) => Ok(value),
			_ => unreachable!(),
		}
	}

	pub fn get_float(&self, handle: ConstantHandle) -> Result<f32> {
		match self.read(handle.expecting(ConstantKind::Float)).pool_context(handle)? {
			ConstantData::Float(value) => Ok(value),
			_ => unreachable!(),
		}
	}

	pub fn get_long(&self, handle: ConstantHandle) -> Result<i64> {
		match self.read(handle.expecting(ConstantKind::Long)).pool_context(handle)? {
			ConstantData::Long(value) => Ok(value),
			_ => unreachable!(),
		}
	}

	pub fn get_double(&self, handle: ConstantHandle) -> Result<f64> {
		match self.read(handle.expecting(ConstantKind::Double)).pool_context(handle)? {
			ConstantData::Double(value) => Ok(value),
			_ => unreachable!(),
		}
	}

	/// Resolves a `Class` entry down to its name string.
	pub fn get_class_name(&self, handle: ConstantHandle) -> Result<JavaString> {
		match self.read(handle.expecting(ConstantKind::Class)).pool_context(handle)? {
			ConstantData::Class { name } => self.get_utf8(name),
			_ => unreachable!(),
		}
	}

	/// Resolves a `String` entry down to its value.
	pub fn get_string_value(&self, handle: ConstantHandle) -> Result<JavaString> {
		match self.read(handle.expecting(ConstantKind::String)).pool_context(handle)? {
			ConstantData::String { value } => self.get_utf8(value),
			_ => unreachable!(),
		}
	}

	/// Resolves a `NameAndType` entry down to its two strings.
	pub fn get_name_and_type(&self, handle: ConstantHandle) -> Result<(JavaString, JavaString)> {
		match self.read(handle.expecting(ConstantKind::NameAndType)).pool_context(handle)? {
			ConstantData::NameAndType { name, descriptor } => Ok((self.get_utf8(name)?, self.get_utf8(descriptor)?)),
			_ => unreachable!(),
		}
	}

	/// Writes the pool back out: the count, then every non-reserved entry as
	/// tag plus raw body.
	pub fn write(&self, sink: &mut Vec<u8>) -> Result<()> {
		sink.write_u16(self.count())?;
		for entry in &self.entries {
			if let Some(tag) = entry.kind.to_tag() {
				sink.write_u8(tag)?;
				sink.write_u8_slice(&entry.data)?;
			}
		}
		Ok(())
	}
}

/// Tiny helper trait for adding pool slots to errors.
trait PoolContext {
	fn pool_context(self, handle: ConstantHandle) -> Self;
}
impl<T> PoolContext for Result<T> {
	fn pool_context(self, handle: ConstantHandle) -> Self {
		self.with_context(|| anyhow!("while getting pool slot {}", handle.slot()))
	}
}
