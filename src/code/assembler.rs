//! Building a code array instruction by instruction.

use anyhow::{anyhow, bail, Context, Result};
use crate::{ClassWrite, ClassError};
use crate::class_constants::{atype, opcode};
use crate::code::{ExceptionHandler, Label};
use crate::pool::{ConstantHandle, ConstantKind};

fn put_i16_at(writer: &mut [u8], pos: usize, value: i16) {
	let [a, b] = value.to_be_bytes();
	writer[pos] = a;
	writer[pos + 1] = b;
}

fn put_i32_at(writer: &mut [u8], pos: usize, value: i32) {
	let [a, b, c, d] = value.to_be_bytes();
	writer[pos] = a;
	writer[pos + 1] = b;
	writer[pos + 2] = c;
	writer[pos + 3] = d;
}

/// A branch or switch operand whose final value waits for label resolution.
#[derive(Debug)]
struct BranchSite {
	/// The opcode position the displacement is relative to.
	opcode_pos: u16,
	/// Where in the code buffer the reserved displacement bytes sit.
	write_pos: usize,
	label: Label,
	/// If true the reserved slot is an `i32`, otherwise an `i16`.
	wide: bool,
}

#[derive(Debug)]
struct PendingHandler {
	start: Label,
	end: Option<Label>,
	handler: Label,
	catch_type: ConstantHandle,
}

/// The finished output of a [`CodeAssembler`]: the code bytes with every
/// displacement fixed up, and the exception handler table with resolved
/// offsets, in the order the blocks were opened.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledCode {
	pub code: Vec<u8>,
	pub exceptions: Vec<ExceptionHandler>,
}

impl AssembledCode {
	/// Writes the exception table: the `u16` count, then the four `u16`s of
	/// each handler record.
	pub fn write_exception_table(&self, sink: &mut Vec<u8>) -> Result<()> {
		sink.write_slice(&self.exceptions,
			|w, len| w.write_usize_as_u16(len).context("too many exception handlers"),
			|w, handler| {
				w.write_u16(handler.start)?;
				w.write_u16(handler.end)?;
				w.write_u16(handler.handler)?;
				w.write_u16(handler.catch_type.slot())
			},
		)
	}
}

/// A fluent, label-based emitter for one code array.
///
/// Every call appends one instruction. Local-variable and constant-load
/// instructions pick the shortest legal encoding (`iload_2` over `iload 2`
/// over `wide iload`); branch and switch operands are reserved and resolved
/// against their labels in the single fixup pass of [`CodeAssembler::finish`].
///
/// Single-owner: callers that share an assembler across threads must
/// serialize access themselves, and `finish` consumes the builder.
///
/// ```
/// # fn main() -> anyhow::Result<()> {
/// use arabica::class_constants::opcode;
/// use arabica::code::CodeAssembler;
///
/// let mut asm = CodeAssembler::new();
/// let end = asm.create_label();
/// asm.iload(0)?;
/// asm.branch(opcode::IFLE, end)?;
/// asm.iinc(1, 1)?;
/// asm.mark_label(end)?;
/// asm.op(opcode::RETURN)?;
/// let assembled = asm.finish()?;
/// # let _ = assembled;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CodeAssembler {
	code: Vec<u8>,
	/// Bound offset per label id.
	labels: Vec<Option<u16>>,
	sites: Vec<BranchSite>,
	/// All exception blocks ever opened, in open order.
	exceptions: Vec<PendingHandler>,
	/// Indices into `exceptions` of the blocks still open, innermost last.
	open: Vec<usize>,
}

impl CodeAssembler {
	pub fn new() -> CodeAssembler {
		CodeAssembler::default()
	}

	/// The offset the next instruction will be emitted at.
	pub fn offset(&self) -> u16 {
		self.code.len() as u16
	}

	fn opcode_pos(&self) -> Result<u16> {
		u16::try_from(self.code.len())
			.with_context(|| anyhow!("cannot write code: code size exceeded u16::MAX: {}", self.code.len()))
	}

	/// Returns a fresh, unbound label.
	pub fn create_label(&mut self) -> Label {
		let id = self.labels.len() as u16;
		self.labels.push(None);
		Label { id }
	}

	/// Binds `label` to the current emission offset.
	///
	/// A label is bound exactly once; marking it again is an error.
	pub fn mark_label(&mut self, label: Label) -> Result<()> {
		let offset = self.opcode_pos()?;
		let slot = self.labels.get_mut(label.id as usize)
			.with_context(|| anyhow!("label {label:?} is not from this assembler"))?;
		if let Some(old) = slot {
			bail!("label {label:?} is already bound to offset {old}");
		}
		*slot = Some(offset);
		Ok(())
	}

	fn reserve_branch(&mut self, opcode_pos: u16, label: Label, wide: bool) -> Result<()> {
		if label.id as usize >= self.labels.len() {
			bail!("label {label:?} is not from this assembler");
		}
		self.sites.push(BranchSite { opcode_pos, write_pos: self.code.len(), label, wide });
		if wide {
			self.code.write_i32(i32::MAX)?;
		} else {
			self.code.write_i16(i16::MAX)?;
		}
		Ok(())
	}

	fn align_to_4_byte_boundary(&mut self) -> Result<()> {
		match self.code.len() & 0b11 {
			0 => Ok(()),
			1 => self.code.write_u8_slice(&[0, 0, 0]),
			2 => self.code.write_u8_slice(&[0, 0]),
			3 => self.code.write_u8_slice(&[0]),
			_ => unreachable!(),
		}
	}

	/// Emits an instruction that takes no operand.
	pub fn op(&mut self, op: u8) -> Result<&mut Self> {
		let takes_no_operand = matches!(op,
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
			opcode::MONITOREXIT
		);
		if !takes_no_operand {
			bail!("opcode {op:#x} takes an operand, use the dedicated method");
		}
		self.opcode_pos()?;
		self.code.write_u8(op)?;
		Ok(self)
	}

	pub fn bipush(&mut self, value: i8) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::BIPUSH)?;
		self.code.write_i8(value)?;
		Ok(self)
	}

	pub fn sipush(&mut self, value: i16) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::SIPUSH)?;
		self.code.write_i16(value)?;
		Ok(self)
	}

	pub fn iload(&mut self, index: u16) -> Result<&mut Self> {
		self.load(opcode::ILOAD, index)
	}
	pub fn lload(&mut self, index: u16) -> Result<&mut Self> {
		self.load(opcode::LLOAD, index)
	}
	pub fn fload(&mut self, index: u16) -> Result<&mut Self> {
		self.load(opcode::FLOAD, index)
	}
	pub fn dload(&mut self, index: u16) -> Result<&mut Self> {
		self.load(opcode::DLOAD, index)
	}
	pub fn aload(&mut self, index: u16) -> Result<&mut Self> {
		self.load(opcode::ALOAD, index)
	}

	/// Emits one of the load instructions by its base opcode (`iload` ..
	/// `aload`), picking the shortest legal form.
	pub fn load(&mut self, base: u8, index: u16) -> Result<&mut Self> {
		if !(opcode::ILOAD..=opcode::ALOAD).contains(&base) {
			bail!("opcode {base:#x} is not a load instruction");
		}
		self.short_form_local(base, opcode::ILOAD, opcode::ILOAD_0, index)
	}

	pub fn istore(&mut self, index: u16) -> Result<&mut Self> {
		self.store(opcode::ISTORE, index)
	}
	pub fn lstore(&mut self, index: u16) -> Result<&mut Self> {
		self.store(opcode::LSTORE, index)
	}
	pub fn fstore(&mut self, index: u16) -> Result<&mut Self> {
		self.store(opcode::FSTORE, index)
	}
	pub fn dstore(&mut self, index: u16) -> Result<&mut Self> {
		self.store(opcode::DSTORE, index)
	}
	pub fn astore(&mut self, index: u16) -> Result<&mut Self> {
		self.store(opcode::ASTORE, index)
	}

	/// Emits one of the store instructions by its base opcode (`istore` ..
	/// `astore`), picking the shortest legal form.
	pub fn store(&mut self, base: u8, index: u16) -> Result<&mut Self> {
		if !(opcode::ISTORE..=opcode::ASTORE).contains(&base) {
			bail!("opcode {base:#x} is not a store instruction");
		}
		self.short_form_local(base, opcode::ISTORE, opcode::ISTORE_0, index)
	}

	fn short_form_local(&mut self, base: u8, family_base: u8, dedicated_base: u8, index: u16) -> Result<&mut Self> {
		self.opcode_pos()?;
		if index < 4 {
			// iload_0 .. aload_3 pack (base, index) into the opcode
			self.code.write_u8(((base - family_base) << 2 | index as u8) + dedicated_base)?;
		} else if let Ok(index) = u8::try_from(index) {
			self.code.write_u8(base)?;
			self.code.write_u8(index)?;
		} else {
			self.code.write_u8(opcode::WIDE)?;
			self.code.write_u8(base)?;
			self.code.write_u16(index)?;
		}
		Ok(self)
	}

	pub fn ret(&mut self, index: u16) -> Result<&mut Self> {
		self.opcode_pos()?;
		if let Ok(index) = u8::try_from(index) {
			self.code.write_u8(opcode::RET)?;
			self.code.write_u8(index)?;
		} else {
			self.code.write_u8(opcode::WIDE)?;
			self.code.write_u8(opcode::RET)?;
			self.code.write_u16(index)?;
		}
		Ok(self)
	}

	pub fn iinc(&mut self, index: u16, amount: i16) -> Result<&mut Self> {
		self.opcode_pos()?;
		if let (Ok(index), Ok(amount)) = (u8::try_from(index), i8::try_from(amount)) {
			self.code.write_u8(opcode::IINC)?;
			self.code.write_u8(index)?;
			self.code.write_i8(amount)?;
		} else {
			self.code.write_u8(opcode::WIDE)?;
			self.code.write_u8(opcode::IINC)?;
			self.code.write_u16(index)?;
			self.code.write_i16(amount)?;
		}
		Ok(self)
	}

	/// Loads a constant, picking `ldc2_w` when the handle says `Long` or
	/// `Double`, otherwise the one-byte-index `ldc` when the slot fits in an
	/// `u8` and `ldc_w` when it doesn't.
	pub fn ldc(&mut self, handle: ConstantHandle) -> Result<&mut Self> {
		if matches!(handle.kind(), ConstantKind::Long | ConstantKind::Double) {
			return self.ldc2(handle);
		}
		self.opcode_pos()?;
		if let Ok(index) = u8::try_from(handle.slot()) {
			self.code.write_u8(opcode::LDC)?;
			self.code.write_u8(index)?;
		} else {
			self.code.write_u8(opcode::LDC_W)?;
			self.code.write_u16(handle.slot())?;
		}
		Ok(self)
	}

	/// Loads a two-slot (`Long`/`Double`) constant with `ldc2_w`.
	pub fn ldc2(&mut self, handle: ConstantHandle) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::LDC2_W)?;
		self.code.write_u16(handle.slot())?;
		Ok(self)
	}

	fn pool_op(&mut self, op: u8, handle: ConstantHandle) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(op)?;
		self.code.write_u16(handle.slot())?;
		Ok(self)
	}

	pub fn get_static(&mut self, field: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::GETSTATIC, field)
	}
	pub fn put_static(&mut self, field: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::PUTSTATIC, field)
	}
	pub fn get_field(&mut self, field: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::GETFIELD, field)
	}
	pub fn put_field(&mut self, field: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::PUTFIELD, field)
	}
	pub fn invoke_virtual(&mut self, method: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::INVOKEVIRTUAL, method)
	}
	pub fn invoke_special(&mut self, method: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::INVOKESPECIAL, method)
	}
	pub fn invoke_static(&mut self, method: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::INVOKESTATIC, method)
	}

	/// `invokeinterface` carries an argument-slot count the other invokes
	/// don't; the caller supplies it since this assembler doesn't resolve
	/// descriptors.
	pub fn invoke_interface(&mut self, method: ConstantHandle, count: u8) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::INVOKEINTERFACE)?;
		self.code.write_u16(method.slot())?;
		self.code.write_u8(count)?;
		self.code.write_u8(0)?; // zero
		Ok(self)
	}

	pub fn invoke_dynamic(&mut self, call_site: ConstantHandle) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::INVOKEDYNAMIC)?;
		self.code.write_u16(call_site.slot())?;
		self.code.write_u8(0)?; // zero
		self.code.write_u8(0)?; // zero
		Ok(self)
	}

	pub fn new_object(&mut self, class: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::NEW, class)
	}
	pub fn anewarray(&mut self, class: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::ANEWARRAY, class)
	}
	pub fn checkcast(&mut self, class: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::CHECKCAST, class)
	}
	pub fn instance_of(&mut self, class: ConstantHandle) -> Result<&mut Self> {
		self.pool_op(opcode::INSTANCEOF, class)
	}

	pub fn newarray(&mut self, element_type: u8) -> Result<&mut Self> {
		if !(atype::T_BOOLEAN..=atype::T_LONG).contains(&element_type) {
			bail!("unknown array type {element_type:x}");
		}
		self.opcode_pos()?;
		self.code.write_u8(opcode::NEWARRAY)?;
		self.code.write_u8(element_type)?;
		Ok(self)
	}

	pub fn multianewarray(&mut self, class: ConstantHandle, dimensions: u8) -> Result<&mut Self> {
		self.opcode_pos()?;
		self.code.write_u8(opcode::MULTIANEWARRAY)?;
		self.code.write_u16(class.slot())?;
		self.code.write_u8(dimensions)?;
		Ok(self)
	}

	/// Emits a branch instruction targeting `label`.
	///
	/// The conditional branches, `goto` and `jsr` reserve an `i16`
	/// displacement; `goto_w` and `jsr_w` reserve an `i32`. A displacement
	/// that turns out not to fit its reserved slot fails at
	/// [`CodeAssembler::finish`].
	pub fn branch(&mut self, op: u8, label: Label) -> Result<&mut Self> {
		let wide = match op {
			opcode::IFEQ..=opcode::JSR | opcode::IFNULL | opcode::IFNONNULL => false,
			opcode::GOTO_W | opcode::JSR_W => true,
			_ => bail!("opcode {op:#x} is not a branch instruction"),
		};
		let opcode_pos = self.opcode_pos()?;
		self.code.write_u8(op)?;
		self.reserve_branch(opcode_pos, label, wide)?;
		Ok(self)
	}

	pub fn goto(&mut self, label: Label) -> Result<&mut Self> {
		self.branch(opcode::GOTO, label)
	}

	pub fn goto_w(&mut self, label: Label) -> Result<&mut Self> {
		self.branch(opcode::GOTO_W, label)
	}

	/// Emits a `tableswitch` for the keys `low ..= low + cases.len() - 1`.
	pub fn table_switch(&mut self, default: Label, low: i32, cases: &[Label]) -> Result<&mut Self> {
		if cases.is_empty() {
			bail!("a tableswitch needs at least one case");
		}
		let high = low.checked_add(cases.len() as i32 - 1)
			.with_context(|| anyhow!("tableswitch keys overflow: low={low}, {} cases", cases.len()))?;

		let opcode_pos = self.opcode_pos()?;
		self.code.write_u8(opcode::TABLESWITCH)?;
		self.align_to_4_byte_boundary()?;

		self.reserve_branch(opcode_pos, default, true)?;
		self.code.write_i32(low)?;
		self.code.write_i32(high)?;
		for &case in cases {
			self.reserve_branch(opcode_pos, case, true)?;
		}
		Ok(self)
	}

	/// Emits a `lookupswitch`. The pairs are sorted ascending by key here,
	/// whatever order they were given in; duplicate keys are an error.
	pub fn lookup_switch(&mut self, default: Label, pairs: &[(i32, Label)]) -> Result<&mut Self> {
		let mut pairs = pairs.to_vec();
		pairs.sort_by_key(|&(key, _)| key);
		if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
			bail!("`pairs` must not contain duplicate keys");
		}

		let opcode_pos = self.opcode_pos()?;
		self.code.write_u8(opcode::LOOKUPSWITCH)?;
		self.align_to_4_byte_boundary()?;

		self.reserve_branch(opcode_pos, default, true)?;
		self.code.write_i32(pairs.len() as i32)?;
		for &(key, label) in &pairs {
			self.code.write_i32(key)?;
			self.reserve_branch(opcode_pos, label, true)?;
		}
		Ok(self)
	}

	/// Opens an exception-protected range at the current offset and returns
	/// the label of its handler, to be marked wherever the handler code is
	/// emitted.
	///
	/// `catch_type` is a `Class` handle, or nil for a catch-all entry.
	/// Blocks nest; the table keeps the records in the order the blocks were
	/// opened.
	pub fn begin_exception_block(&mut self, catch_type: ConstantHandle) -> Result<Label> {
		let start = self.create_label();
		self.mark_label(start)?;
		let handler = self.create_label();
		self.open.push(self.exceptions.len());
		self.exceptions.push(PendingHandler { start, end: None, handler, catch_type });
		Ok(handler)
	}

	/// Closes the innermost open exception block at the current offset.
	pub fn end_exception_block(&mut self) -> Result<()> {
		let end = self.create_label();
		self.mark_label(end)?;
		let index = self.open.pop()
			.context("no exception block is open")?;
		self.exceptions[index].end = Some(end);
		Ok(())
	}

	/// Records one exception handler entry with explicit labels, for ranges
	/// that aren't being tracked by [`CodeAssembler::begin_exception_block`]
	/// (relocated handler tables aren't necessarily nested). Entries still
	/// serialize in the order they were recorded.
	pub fn add_exception_handler(&mut self, start: Label, end: Label, handler: Label, catch_type: ConstantHandle) -> Result<()> {
		for label in [start, end, handler] {
			if label.id as usize >= self.labels.len() {
				bail!("label {label:?} is not from this assembler");
			}
		}
		self.exceptions.push(PendingHandler { start, end: Some(end), handler, catch_type });
		Ok(())
	}

	/// Resolves every recorded branch site and handler record and returns
	/// the final bytes. Consumes the assembler; nothing can be appended to
	/// finished code.
	pub fn finish(self) -> Result<AssembledCode> {
		let CodeAssembler { mut code, labels, sites, exceptions, open } = self;

		let resolve = |label: Label| -> Result<u16> {
			labels.get(label.id as usize).copied().flatten()
				.ok_or_else(|| anyhow!(ClassError::UnboundLabel(format!("label {:?} was referenced but never marked", label))))
		};

		if let Some(&index) = open.last() {
			bail!("exception block opened at offset {} was never closed", resolve(exceptions[index].start)?);
		}

		for site in sites {
			let target = resolve(site.label)?;
			let branch = (target as i32) - (site.opcode_pos as i32);

			if site.wide {
				put_i32_at(&mut code, site.write_pos, branch);
			} else {
				let branch = i16::try_from(branch)
					.with_context(|| anyhow!("branch displacement {branch} at offset {} doesn't fit in an i16, use the wide form", site.opcode_pos))?;
				put_i16_at(&mut code, site.write_pos, branch);
			}
		}

		let exceptions = exceptions.into_iter()
			.map(|pending| Ok(ExceptionHandler {
				start: resolve(pending.start)?,
				// closed above, or `open` wouldn't have been empty
				end: resolve(pending.end.context("unclosed exception block")?)?,
				handler: resolve(pending.handler)?,
				catch_type: pending.catch_type,
			}))
			.collect::<Result<Vec<_>>>()?;

		Ok(AssembledCode { code, exceptions })
	}
}
