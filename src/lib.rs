//! A crate for reading, modelling and rewriting
//! [Java Class Files](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html).
//!
//! The model is deliberately close to the wire format: constant pool entries
//! stay raw until a typed read asks for them, references between structures
//! are [kind-tagged handles](pool::ConstantHandle) instead of resolved names,
//! and the collections of a [`ClassFile`](class_file::ClassFile) are lazy
//! views over the decoded byte region that can be enumerated any number of
//! times (also concurrently, a decoded class is immutable).
//!
//! Reading:
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let bytes = std::fs::read("Main.class")?;
//! let class = arabica::read_class(bytes)?;
//! for method in class.methods() {
//!     let method = method?;
//!     let name = class.pool().get_utf8(method.name)?;
//!     println!("{name:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Bytecode goes the other way through [`code::CodeAssembler`], a fluent
//! emitter with label-based branch targets, and the two compose in
//! [`copy`] to relocate code and attributes from one constant pool into
//! another while rewriting every embedded reference.

pub mod attribute;
pub mod class_constants;
pub mod class_file;
pub mod code;
pub mod copy;
pub mod pool;
pub mod version;

mod error;
mod jstring;

pub use error::ClassError;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use crate::class_file::ClassFile;
use crate::error::ClassError as E;

/// Reads a class file from a fully materialized byte source.
///
/// The bytes are kept alive by the returned [`ClassFile`]; its collections
/// are views into them.
pub fn read_class(bytes: impl Into<Bytes>) -> Result<ClassFile> {
	class_file::read(bytes.into())
}

/// Reads a class file from a stream by materializing it first.
///
/// This crate never blocks on I/O itself; the read here happens up front and
/// the decoder only ever sees the in-memory bytes.
pub fn read_class_from(reader: &mut impl std::io::Read) -> Result<ClassFile> {
	let mut vec = Vec::new();
	reader.read_to_end(&mut vec).context("failed to read class file bytes")?;
	read_class(vec)
}

/// A forward, bounds-checked cursor over an in-memory byte region.
///
/// Overruns fail with [`ClassError::Truncated`]; the cursor never
/// short-reads. Cloning is cheap (the underlying [`Bytes`] is shared), and
/// every clone has its own position, which is what makes the lazy
/// collections of a [`ClassFile`] restartable.
#[derive(Debug, Clone)]
pub(crate) struct ByteCursor {
	data: Bytes,
	pos: usize,
}

impl ByteCursor {
	pub(crate) fn new(data: Bytes) -> ByteCursor {
		ByteCursor { data, pos: 0 }
	}

	pub(crate) fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	pub(crate) fn is_at_end(&self) -> bool {
		self.pos == self.data.len()
	}

	fn take(&mut self, n: usize) -> Result<usize> {
		if n > self.remaining() {
			return Err(anyhow!(E::Truncated(format!(
				"need {n} bytes at offset {}, but only {} are left", self.pos, self.remaining()
			))));
		}
		let start = self.pos;
		self.pos += n;
		Ok(start)
	}

	/// Returns `n` bytes as a shared slice of the underlying region, without copying.
	pub(crate) fn read_slice(&mut self, n: usize) -> Result<Bytes> {
		let start = self.take(n)?;
		Ok(self.data.slice(start..start + n))
	}
}

/// Big-endian reads over some byte source.
///
/// All multi-byte integers of the class file format are big-endian; the
/// default methods build every width out of [`ClassRead::read_n`].
pub(crate) trait ClassRead {
	fn marker(&self) -> usize;
	fn skip(&mut self, n: usize) -> Result<()>;
	fn goto(&mut self, pos: usize) -> Result<()>;
	fn with_pos<T>(&mut self, pos: usize, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
		let marker = self.marker();
		self.goto(pos)?;
		let r = f(self)?;
		self.goto(marker)?;
		Ok(r)
	}

	fn read_n<const N: usize>(&mut self) -> Result<[u8; N]>;
	fn read_u8(&mut self) -> Result<u8> {
		Ok(u8::from_be_bytes(self.read_n().context("couldn't read u8, perhaps the data's end is reached?")?))
	}
	fn read_u16(&mut self) -> Result<u16> {
		Ok(u16::from_be_bytes(self.read_n().context("couldn't read u16, perhaps the data's end is reached?")?))
	}
	fn read_u32(&mut self) -> Result<u32> {
		Ok(u32::from_be_bytes(self.read_n().context("couldn't read u32, perhaps the data's end is reached?")?))
	}
	fn read_u64(&mut self) -> Result<u64> {
		Ok(u64::from_be_bytes(self.read_n().context("couldn't read u64, perhaps the data's end is reached?")?))
	}
	fn read_i8(&mut self) -> Result<i8> {
		Ok(i8::from_be_bytes(self.read_n().context("couldn't read i8, perhaps the data's end is reached?")?))
	}
	fn read_i16(&mut self) -> Result<i16> {
		Ok(i16::from_be_bytes(self.read_n().context("couldn't read i16, perhaps the data's end is reached?")?))
	}
	fn read_i32(&mut self) -> Result<i32> {
		Ok(i32::from_be_bytes(self.read_n().context("couldn't read i32, perhaps the data's end is reached?")?))
	}
	fn read_i64(&mut self) -> Result<i64> {
		Ok(i64::from_be_bytes(self.read_n().context("couldn't read i64, perhaps the data's end is reached?")?))
	}

	fn read_u8_as_usize(&mut self) -> Result<usize> {
		Ok(self.read_u8()? as usize)
	}
	fn read_u16_as_usize(&mut self) -> Result<usize> {
		Ok(self.read_u16()? as usize)
	}
	fn read_u32_as_usize(&mut self) -> Result<usize> {
		Ok(self.read_u32()? as usize)
	}

	fn read_u8_vec(&mut self, size: usize) -> Result<Vec<u8>>;
	fn read_vec<T, S, E>(&mut self, get_size: S, mut get_element: E) -> Result<Vec<T>>
	where
		S: FnOnce(&mut Self) -> Result<usize>,
		E: FnMut(&mut Self) -> Result<T>,
	{
		let size = get_size(self)?;
		let mut vec = Vec::with_capacity(size.min(1024));
		for _ in 0..size {
			vec.push(get_element(self)?);
		}
		Ok(vec)
	}
}

impl ClassRead for ByteCursor {
	fn marker(&self) -> usize {
		self.pos
	}
	fn skip(&mut self, n: usize) -> Result<()> {
		self.take(n)?;
		Ok(())
	}
	fn goto(&mut self, pos: usize) -> Result<()> {
		if pos > self.data.len() {
			return Err(anyhow!(E::Truncated(format!(
				"can't seek to offset {pos}, the region is only {} bytes", self.data.len()
			))));
		}
		self.pos = pos;
		Ok(())
	}

	fn read_n<const N: usize>(&mut self) -> Result<[u8; N]> {
		let start = self.take(N)?;
		let mut buf = [0u8; N];
		buf.copy_from_slice(&self.data[start..start + N]);
		Ok(buf)
	}
	fn read_u8_vec(&mut self, size: usize) -> Result<Vec<u8>> {
		let start = self.take(size)?;
		Ok(self.data[start..start + size].to_vec())
	}
}

/// Big-endian writes into some growable byte sink.
///
/// Implemented for everything [`std::io::Write`]; the sink used throughout
/// this crate is a plain `Vec<u8>`, so nested length-prefixed structures are
/// assembled bottom-up in buffers and spliced together.
pub(crate) trait ClassWrite {
	fn write_u8(&mut self, value: u8) -> Result<()> {
		self.write_u8_slice(&[value]).context("couldn't write u8")
	}
	fn write_u16(&mut self, value: u16) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write u16")
	}
	fn write_u32(&mut self, value: u32) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write u32")
	}
	fn write_i8(&mut self, value: i8) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write i8")
	}
	fn write_i16(&mut self, value: i16) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write i16")
	}
	fn write_i32(&mut self, value: i32) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write i32")
	}
	fn write_i64(&mut self, value: i64) -> Result<()> {
		self.write_u8_slice(&value.to_be_bytes()).context("couldn't write i64")
	}

	fn write_usize_as_u16(&mut self, value: usize) -> Result<()> {
		self.write_u16(u16::try_from(value).with_context(|| anyhow!("failed to convert {value} to u16 for writing: value too large"))?)
	}
	fn write_usize_as_u32(&mut self, value: usize) -> Result<()> {
		self.write_u32(u32::try_from(value).with_context(|| anyhow!("failed to convert {value} to u32 for writing: value too large"))?)
	}

	fn write_u8_slice(&mut self, buf: &[u8]) -> Result<()>;
	fn write_slice<'t, T>(
		&mut self,
		slice: &'t [T],
		put_size: impl FnOnce(&mut Self, usize) -> Result<()>,
		mut put_element: impl FnMut(&mut Self, &'t T) -> Result<()>,
	) -> Result<()> {
		put_size(self, slice.len())?;
		for value in slice {
			put_element(self, value)?;
		}
		Ok(())
	}
}

impl<T: std::io::Write> ClassWrite for T {
	fn write_u8_slice(&mut self, buf: &[u8]) -> Result<()> {
		self.write_all(buf).context("failed to write &[u8]")
	}
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use bytes::Bytes;
	use pretty_assertions::assert_eq;
	use crate::{ByteCursor, ClassError, ClassRead, ClassWrite};

	#[test]
	fn cursor_reads_big_endian() -> Result<()> {
		let mut r = ByteCursor::new(Bytes::from_static(&[0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x41]));
		assert_eq!(r.read_u32()?, 0xCAFE_BABE);
		assert_eq!(r.read_u16()?, 0x41);
		assert!(r.is_at_end());
		Ok(())
	}

	#[test]
	fn cursor_overrun_is_truncated() {
		let mut r = ByteCursor::new(Bytes::from_static(&[0x00]));
		let err = r.read_u16().unwrap_err();
		assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::Truncated(_))));
	}

	#[test]
	fn cursor_slices_share_the_region() -> Result<()> {
		let mut r = ByteCursor::new(Bytes::from_static(&[1, 2, 3, 4, 5]));
		r.skip(1)?;
		let slice = r.read_slice(3)?;
		assert_eq!(&slice[..], &[2, 3, 4]);
		assert_eq!(r.read_u8()?, 5);
		Ok(())
	}

	#[test]
	fn writes_are_big_endian() -> Result<()> {
		let mut w = Vec::new();
		w.write_u16(0xCAFE)?;
		w.write_i16(-2)?;
		assert_eq!(w, [0xCA, 0xFE, 0xFF, 0xFE]);
		Ok(())
	}
}
