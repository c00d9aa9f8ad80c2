//! Decoding a code array into [`Instruction`]s.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use crate::{ByteCursor, ClassRead};
use crate::class_constants::{atype, opcode};
use crate::code::{absolute_target, Instruction, LookupSwitchPayload, Operand, TableSwitchPayload};
use crate::pool::{ConstantHandle, ConstantKind};

/// A forward-only cursor over one code array, yielding one instruction per
/// step.
///
/// Single-owner and not re-entrant: there is one read position. A fresh
/// reader over the same bytes starts over at offset zero.
///
/// [`BytecodeReader::try_read_next`] returns `Ok(None)` only for the clean
/// end of the array; an instruction that runs past the end, or an opcode the
/// format doesn't have, is a hard error.
#[derive(Debug)]
pub struct BytecodeReader {
	cursor: ByteCursor,
	code_length: u16,
}

impl BytecodeReader {
	/// Creates a reader over a code array.
	///
	/// The format limits a code array to less than 65536 bytes (offsets are
	/// `u16` everywhere); longer input is rejected here.
	pub fn new(code: impl Into<Bytes>) -> Result<BytecodeReader> {
		let code = code.into();
		let code_length = u16::try_from(code.len())
			.with_context(|| anyhow!("a code array must be less than 65536 bytes, got {}", code.len()))?;
		Ok(BytecodeReader { cursor: ByteCursor::new(code), code_length })
	}

	/// The offset the next instruction would decode at.
	pub fn offset(&self) -> u16 {
		self.cursor.marker() as u16
	}

	/// Checks a branch target computed from `displacement` lands on a byte
	/// of this code array.
	fn target(&self, opcode_pos: u16, displacement: i32) -> Result<()> {
		let target = absolute_target(opcode_pos, displacement)?;
		if target >= self.code_length {
			bail!("branch target {target} is out of bounds for code length {}", self.code_length);
		}
		Ok(())
	}

	/// Skips the padding in front of switch operands: they begin on a 4-byte
	/// boundary, measured from the start of the code array.
	fn align_to_4_byte_boundary(&mut self) -> Result<()> {
		match self.cursor.marker() & 0b11 {
			0 => {},
			1 => { self.cursor.read_u8()?; self.cursor.read_u8()?; self.cursor.read_u8()?; },
			2 => { self.cursor.read_u8()?; self.cursor.read_u8()?; },
			3 => { self.cursor.read_u8()?; },
			_ => unreachable!(),
		};
		Ok(())
	}

	/// Decodes the next instruction, or returns [`None`] at the clean end of
	/// the code array.
	pub fn try_read_next(&mut self) -> Result<Option<Instruction>> {
		if self.cursor.is_at_end() {
			return Ok(None);
		}

		let opcode_pos = self.offset();

		self.read_at(opcode_pos)
			.map(Some)
			.with_context(|| anyhow!("at bytecode offset {opcode_pos}"))
	}

	fn read_at(&mut self, opcode_pos: u16) -> Result<Instruction> {
		let mut wide = false;
		let mut op = self.cursor.read_u8()?;

		let operand = match op {
			opcode::NOP..=opcode::DCONST_1 |
			opcode::IALOAD..=opcode::SALOAD |
			opcode::IASTORE..=opcode::SASTORE |
			opcode::POP..=opcode::SWAP |
			opcode::IADD..=opcode::LXOR |
			opcode::I2L..=opcode::I2S |
			opcode::LCMP..=opcode::DCMPG |
			opcode::IRETURN..=opcode::RETURN |
			opcode::ARRAYLENGTH |
			opcode::ATHROW |
			opcode::MONITORENTER |
			opcode::MONITOREXIT => Operand::None,

			opcode::BIPUSH => Operand::Byte(self.cursor.read_i8()?),
			opcode::SIPUSH => Operand::Short(self.cursor.read_i16()?),

			// any loadable constant may sit behind these, so the handle stays untyped
			opcode::LDC => Operand::Pool(ConstantHandle::new(self.cursor.read_u8()? as u16, ConstantKind::Unknown)),
			opcode::LDC_W | opcode::LDC2_W => Operand::Pool(ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::Unknown)),

			opcode::ILOAD..=opcode::ALOAD |
			opcode::ISTORE..=opcode::ASTORE |
			opcode::RET => Operand::Local(self.cursor.read_u8()? as u16),

			op_ @ opcode::ILOAD_0..=opcode::ALOAD_3 => {
				// iload_0 .. aload_3 are (base, index) packed into the opcode
				let shifted = op_ - opcode::ILOAD_0;
				op = opcode::ILOAD + (shifted >> 2);
				Operand::Local((shifted & 0b11) as u16)
			},
			op_ @ opcode::ISTORE_0..=opcode::ASTORE_3 => {
				let shifted = op_ - opcode::ISTORE_0;
				op = opcode::ISTORE + (shifted >> 2);
				Operand::Local((shifted & 0b11) as u16)
			},

			opcode::IINC => Operand::Inc {
				index: self.cursor.read_u8()? as u16,
				amount: self.cursor.read_i8()? as i16,
			},

			opcode::IFEQ..=opcode::JSR |
			opcode::IFNULL | opcode::IFNONNULL => {
				let displacement = self.cursor.read_i16()? as i32;
				self.target(opcode_pos, displacement)?;
				Operand::Branch(displacement)
			},
			opcode::GOTO_W | opcode::JSR_W => {
				let displacement = self.cursor.read_i32()?;
				self.target(opcode_pos, displacement)?;
				Operand::Branch(displacement)
			},

			opcode::TABLESWITCH => {
				self.align_to_4_byte_boundary()?;

				let default = self.cursor.read_i32()?;
				self.target(opcode_pos, default)?;

				let low = self.cursor.read_i32()?;
				let high = self.cursor.read_i32()?;
				if low > high {
					bail!("in tableswitch `low` must be lower or equal to `high`, it's low={low:?} and high={high:?}");
				}

				let n = (high as i64 - low as i64 + 1) as usize;
				let mut offsets = Vec::with_capacity(n.min(1024));
				for _ in 0..n {
					let displacement = self.cursor.read_i32()?;
					self.target(opcode_pos, displacement)?;
					offsets.push(displacement);
				}

				Operand::TableSwitch(TableSwitchPayload { default, low, high, offsets })
			},
			opcode::LOOKUPSWITCH => {
				self.align_to_4_byte_boundary()?;

				let default = self.cursor.read_i32()?;
				self.target(opcode_pos, default)?;

				let n = self.cursor.read_i32()?;
				if n < 0 {
					bail!("in lookupswitch the `npairs` must be positive, it's npairs={n:?}");
				}

				let mut pairs = Vec::with_capacity((n as usize).min(1024));
				for _ in 0..n {
					let key = self.cursor.read_i32()?;
					let displacement = self.cursor.read_i32()?;
					self.target(opcode_pos, displacement)?;
					pairs.push((key, displacement));
				}

				Operand::LookupSwitch(LookupSwitchPayload { default, pairs })
			},

			opcode::GETSTATIC | opcode::PUTSTATIC | opcode::GETFIELD | opcode::PUTFIELD =>
				Operand::Pool(ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::FieldRef)),
			opcode::INVOKEVIRTUAL =>
				Operand::Pool(ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::MethodRef)),
			// from version 52.0 on these may target interface methods too,
			// so the handle can't commit to a single kind
			opcode::INVOKESPECIAL | opcode::INVOKESTATIC =>
				Operand::Pool(ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::Unknown)),
			opcode::INVOKEINTERFACE => {
				let reference = ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::InterfaceMethodRef);
				let count = self.cursor.read_u8()?;
				let _zero = self.cursor.read_u8()?;
				Operand::PoolAndCount { reference, count }
			},
			opcode::INVOKEDYNAMIC => {
				let reference = ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::InvokeDynamic);
				let _zero = self.cursor.read_u8()?;
				let _zero = self.cursor.read_u8()?;
				Operand::Pool(reference)
			},

			opcode::NEW | opcode::ANEWARRAY | opcode::CHECKCAST | opcode::INSTANCEOF =>
				Operand::Pool(ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::Class)),
			opcode::NEWARRAY => {
				let code = self.cursor.read_u8()?;
				if !(atype::T_BOOLEAN..=atype::T_LONG).contains(&code) {
					bail!("unknown array type {code:x}");
				}
				Operand::ArrayType(code)
			},
			opcode::MULTIANEWARRAY => Operand::PoolAndDimensions {
				class: ConstantHandle::new(self.cursor.read_u16()?, ConstantKind::Class),
				dimensions: self.cursor.read_u8()?,
			},

			opcode::WIDE => {
				wide = true;
				op = self.cursor.read_u8()?;
				match op {
					opcode::ILOAD..=opcode::ALOAD |
					opcode::ISTORE..=opcode::ASTORE |
					opcode::RET => Operand::Local(self.cursor.read_u16()?),
					opcode::IINC => Operand::Inc {
						index: self.cursor.read_u16()?,
						amount: self.cursor.read_i16()?,
					},
					wide_opcode => bail!("unknown wide opcode {wide_opcode:x?}"),
				}
			},

			opcode::BREAKPOINT => bail!("unknown opcode breakpoint"),
			opcode::IMPDEP1 => bail!("unknown opcode impdep1"),
			opcode::IMPDEP2 => bail!("unknown opcode impdep2"),
			op_ => bail!("unknown opcode {op_:x?}"),
		};

		Ok(Instruction { opcode: op, offset: opcode_pos, wide, operand })
	}

	/// Decodes everything that's left.
	pub fn read_all(&mut self) -> Result<Vec<Instruction>> {
		let mut vec = Vec::new();
		while let Some(instruction) = self.try_read_next()? {
			vec.push(instruction);
		}
		Ok(vec)
	}
}

#[cfg(test)]
mod testing {
	use anyhow::Result;
	use pretty_assertions::assert_eq;
	use crate::class_constants::opcode;
	use crate::code::{BytecodeReader, Instruction, Operand};
	use crate::error::ClassError;
	use crate::pool::ConstantKind;

	#[test]
	fn clean_end_is_none() -> Result<()> {
		let mut reader = BytecodeReader::new(vec![opcode::NOP, opcode::RETURN])?;
		assert!(reader.try_read_next()?.is_some());
		assert!(reader.try_read_next()?.is_some());
		assert_eq!(reader.try_read_next()?, None);
		// and stays that way
		assert_eq!(reader.try_read_next()?, None);
		Ok(())
	}

	#[test]
	fn truncation_inside_an_instruction_is_an_error() {
		let mut reader = BytecodeReader::new(vec![opcode::SIPUSH, 0x01]).unwrap();
		let err = reader.try_read_next().unwrap_err();
		assert!(matches!(err.downcast_ref::<ClassError>(), Some(ClassError::Truncated(_))));
	}

	#[test]
	fn dedicated_load_forms_normalize() -> Result<()> {
		// aload_2 is 0x2c
		let mut reader = BytecodeReader::new(vec![0x2c])?;
		assert_eq!(reader.try_read_next()?, Some(Instruction {
			opcode: opcode::ALOAD,
			offset: 0,
			wide: false,
			operand: Operand::Local(2),
		}));
		Ok(())
	}

	#[test]
	fn wide_is_a_flag_not_an_opcode() -> Result<()> {
		let mut reader = BytecodeReader::new(vec![opcode::WIDE, opcode::ILOAD, 0x01, 0x00])?;
		assert_eq!(reader.try_read_next()?, Some(Instruction {
			opcode: opcode::ILOAD,
			offset: 0,
			wide: true,
			operand: Operand::Local(256),
		}));
		Ok(())
	}

	#[test]
	fn instructions_remember_their_offset() -> Result<()> {
		let mut reader = BytecodeReader::new(vec![
			opcode::NOP,
			opcode::GOTO, 0xff, 0xff, // back to the nop
		])?;
		reader.try_read_next()?;
		let goto = reader.try_read_next()?.map(|i| (i.offset, i.branch_target().map(Result::ok)));
		assert_eq!(goto, Some((1, Some(Some(0)))));
		Ok(())
	}

	#[test]
	fn tableswitch_skips_its_padding() -> Result<()> {
		// offset 0, so 3 padding bytes after the opcode
		let mut code = vec![opcode::TABLESWITCH, 0, 0, 0];
		code.extend_from_slice(&12i32.to_be_bytes()); // default
		code.extend_from_slice(&0i32.to_be_bytes());  // low
		code.extend_from_slice(&1i32.to_be_bytes());  // high
		code.extend_from_slice(&20i32.to_be_bytes());
		code.extend_from_slice(&24i32.to_be_bytes());
		code.extend_from_slice(&[opcode::NOP; 8]);

		let mut reader = BytecodeReader::new(code)?;
		let Some(Instruction { operand: Operand::TableSwitch(payload), .. }) = reader.try_read_next()? else {
			panic!("expected a tableswitch");
		};
		assert_eq!(payload.default, 12);
		assert_eq!((payload.low, payload.high), (0, 1));
		assert_eq!(payload.offsets, [20, 24]);
		Ok(())
	}

	#[test]
	fn ldc_handles_stay_untyped() -> Result<()> {
		let mut reader = BytecodeReader::new(vec![opcode::LDC, 0x07])?;
		let Some(Instruction { operand: Operand::Pool(handle), .. }) = reader.try_read_next()? else {
			panic!("expected a pool operand");
		};
		assert_eq!(handle.slot(), 7);
		assert_eq!(handle.kind(), ConstantKind::Unknown);
		Ok(())
	}

	#[test]
	fn branch_out_of_the_code_array_is_rejected() {
		let mut reader = BytecodeReader::new(vec![opcode::GOTO, 0x10, 0x00]).unwrap();
		assert!(reader.try_read_next().is_err());
	}
}
