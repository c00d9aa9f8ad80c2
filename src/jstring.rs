//! Methods for converting the string format used in the Java Virtual Machine
//! Specification to and from rust strings.
//!
//! The class file format stores text in a modified UTF-8: `\0` takes two
//! bytes, and code points above `U+FFFF` are stored as surrogate pairs of
//! three bytes each. The `java_string` crate implements this codec; the rest
//! of this crate goes through the two functions below and never looks at the
//! encoding itself.
//!
//! See <https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.4.7>.

use std::borrow::Cow;
use anyhow::{anyhow, Context, Result};
use java_string::{JavaStr, JavaString};

/// Takes in a vec of data, tries to read it into a [`JavaString`].
pub(crate) fn from_vec_to_string(vec: Vec<u8>) -> Result<JavaString> {
	JavaString::from_modified_utf8(vec)
		.with_context(|| anyhow!("invalid java utf8 contents"))
}

/// Takes in a string and writes it out into a vec.
pub(crate) fn from_string_to_vec(string: &JavaStr) -> Cow<[u8]> {
	string.to_modified_utf8()
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use java_string::JavaStr;
	use pretty_assertions::assert_eq;
	use crate::jstring::{from_string_to_vec, from_vec_to_string};

	#[test]
	fn nul_is_two_bytes() -> Result<()> {
		let raw = [0b1100_0000, 0b1000_0000];
		assert_eq!(from_string_to_vec(JavaStr::from_str("\0")), &raw[..]);
		assert_eq!(from_vec_to_string(raw.to_vec())?, JavaStr::from_str("\0"));
		Ok(())
	}

	#[test]
	fn ascii_round_trip() -> Result<()> {
		let s = JavaStr::from_str("org/example/Main");
		assert_eq!(from_vec_to_string(from_string_to_vec(s).into_owned())?, s);
		Ok(())
	}

	#[test]
	fn supplementary_uses_surrogates() -> Result<()> {
		// U+10400 encodes as the surrogate pair D801 DC00, three bytes each.
		let raw = from_string_to_vec(JavaStr::from_str("\u{10400}"));
		assert_eq!(raw.len(), 6);
		assert_eq!(from_vec_to_string(raw.into_owned())?, JavaStr::from_str("\u{10400}"));
		Ok(())
	}
}
