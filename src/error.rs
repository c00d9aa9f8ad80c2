//! The failure conditions a caller can tell apart.
//!
//! All errors in this crate travel as [`anyhow::Error`]. The conditions below
//! are attached as the root cause where the distinction matters to callers,
//! so `err.downcast_ref::<ClassError>()` can classify a failure without
//! parsing message strings. Everything else on the chain is context.

use std::fmt::{Display, Formatter};

/// The distinct failure conditions of decoding, resolution and assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassError {
	/// The input is shorter than the fixed class file header, or the magic
	/// bytes don't match.
	MalformedHeader(String),
	/// A fixed or length-prefixed region runs past the available bytes.
	Truncated(String),
	/// A constant pool handle points at a slot that isn't there, or a typed
	/// read found a different kind stored than the handle declared.
	InvalidReference(String),
	/// An assembler was finished while a referenced label was never marked.
	UnboundLabel(String),
	/// An attribute with a recognized name has a body that doesn't parse
	/// per that name's known shape.
	UnsupportedBody(String),
}

impl Display for ClassError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			ClassError::MalformedHeader(detail) => write!(f, "malformed header: {detail}"),
			ClassError::Truncated(detail) => write!(f, "truncated structure: {detail}"),
			ClassError::InvalidReference(detail) => write!(f, "invalid constant pool reference: {detail}"),
			ClassError::UnboundLabel(detail) => write!(f, "unbound label: {detail}"),
			ClassError::UnsupportedBody(detail) => write!(f, "unsupported attribute body: {detail}"),
		}
	}
}

impl std::error::Error for ClassError {}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use crate::error::ClassError;

	#[test]
	fn downcast_through_context() {
		use anyhow::Context;

		let err: Result<()> = Err(ClassError::Truncated("need 4 bytes".to_owned()))
			.context("while reading the exception table");
		let err = err.unwrap_err();

		assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::Truncated(_))));
	}
}
