use super::operand::{Immediate, Operand};
use super::registers::{REX_B, REX_NONE, REX_PREFIX, REX_R, REX_W, Register};
use crate::{
    Error, Result,
    buffer::{CodeBuffer, DEFAULT_INITIAL_CAPACITY, MAX_CAPACITY},
    label::{Label, OwnerId},
    mmap::ExecutableCode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const OPCODE_ADD_RM_TO_REG: u8 = 0x03; // ADD r64, r/m64
const OPCODE_ADD_REG_TO_RM: u8 = 0x01; // ADD r/m64, r64
const OPCODE_MOV_IMM64: u8 = 0xb8; // MOV r64, imm64 (B8+rd)
const OPCODE_JMP_REL32: u8 = 0xe9;
const OPCODE_RET: u8 = 0xc3;

/// MOV r64, imm64: REX.W + opcode + 8-byte immediate
const MOV_IMM64_SIZE: usize = 10;
const JMP_REL32_SIZE: usize = 5;

/// Source of assembler ids stamped into the labels they link or bind
static NEXT_ASSEMBLER_ID: AtomicU64 = AtomicU64::new(1);

fn next_assembler_id() -> OwnerId {
    NEXT_ASSEMBLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Registers the assembler may clobber while synthesizing instructions
/// that have no single-opcode form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegisters {
    /// Holds immediates for `add reg, imm` and `add [mem], imm`
    pub gpr: Register,
}

impl Default for ScratchRegisters {
    fn default() -> Self {
        // R11 is caller-saved and carries no arguments in the System V and
        // Windows x64 conventions.
        Self { gpr: Register::R11 }
    }
}

/// Requested encoding for a jump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JumpDistance {
    /// Accepted for callers that know the target is near. Always encoded
    /// as rel32; a short jump to a label that is not bound yet is promoted.
    Short,
    /// rel32
    #[default]
    Near,
}

pub struct AssemblerBuilder {
    initial_capacity: usize,
    max_capacity: usize,
    scratch: ScratchRegisters,
}

impl Default for AssemblerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AssemblerBuilder {
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_capacity: MAX_CAPACITY,
            scratch: ScratchRegisters::default(),
        }
    }

    /// Bytes allocated up front; the buffer grows geometrically from there
    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Upper bound on the code size; clamped to `i32::MAX`
    pub fn max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Register clobbered by `emit_add_ri` and `emit_add_mi`
    pub fn scratch(mut self, scratch: ScratchRegisters) -> Self {
        self.scratch = scratch;
        self
    }

    /// Allocates the code buffer.
    ///
    /// Fails with `UnsupportedEncoding` if the scratch register is RSP, which
    /// would clobber the stack pointer.
    pub fn build(self) -> Result<Assembler> {
        if self.scratch.gpr == Register::RSP {
            return Err(Error::UnsupportedEncoding(
                "RSP cannot be the scratch register".to_string(),
            ));
        }
        Ok(Assembler {
            id: next_assembler_id(),
            buffer: CodeBuffer::new(self.initial_capacity, self.max_capacity)?,
            scratch: self.scratch,
            unresolved_labels: 0,
        })
    }
}

/// x86-64 assembler for runtime code generation
///
/// Instructions are appended in program order. Each emitting method either
/// writes the whole instruction or, on error, nothing at all.
#[derive(Debug)]
pub struct Assembler {
    id: OwnerId,
    buffer: CodeBuffer,
    scratch: ScratchRegisters,
    /// Labels referenced by a pending patch site and not yet bound
    unresolved_labels: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    /// Creates an assembler with the default configuration
    pub fn new() -> Self {
        Self {
            id: next_assembler_id(),
            buffer: CodeBuffer::default(),
            scratch: ScratchRegisters::default(),
            unresolved_labels: 0,
        }
    }

    pub fn builder() -> AssemblerBuilder {
        AssemblerBuilder::new()
    }

    /// Returns the number of bytes emitted so far
    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Returns the code emitted so far
    pub fn code(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    pub fn scratch(&self) -> ScratchRegisters {
        self.scratch
    }

    /// Number of labels that still have unpatched references
    pub fn unresolved_labels(&self) -> usize {
        self.unresolved_labels
    }

    /// Loads a 64-bit immediate value into a register
    /// MOV reg, imm64
    pub fn emit_mov_imm64(&mut self, dst: Register, imm: Immediate) -> Result<()> {
        self.buffer.reserve(MOV_IMM64_SIZE)?;
        self.emit_register_rex(dst, REX_W)?;
        self.buffer.emit_u8(OPCODE_MOV_IMM64 | dst.low_bits())?;
        self.buffer.emit_i64(imm)
    }

    /// ADD dst, src
    pub fn emit_add_rr(&mut self, dst: Register, src: Register) -> Result<()> {
        let op = Operand::register(src);
        self.emit_operand_insn(OPCODE_ADD_RM_TO_REG, dst, &op)
    }

    /// ADD dst, [addr]
    pub fn emit_add_rm(&mut self, dst: Register, addr: &Operand) -> Result<()> {
        self.emit_operand_insn(OPCODE_ADD_RM_TO_REG, dst, addr)
    }

    /// ADD [addr], src
    pub fn emit_add_mr(&mut self, addr: &Operand, src: Register) -> Result<()> {
        self.emit_operand_insn(OPCODE_ADD_REG_TO_RM, src, addr)
    }

    /// ADD dst, imm
    ///
    /// Emitted as `MOV scratch, imm; ADD dst, scratch`, which clobbers the
    /// scratch register.
    pub fn emit_add_ri(&mut self, dst: Register, imm: Immediate) -> Result<()> {
        let tmp = self.scratch.gpr;
        if dst == tmp {
            return Err(Error::UnsupportedEncoding(format!(
                "{:?} is the scratch register and cannot be the destination of add with an immediate",
                dst
            )));
        }
        let op = Operand::register(tmp);
        self.buffer
            .reserve(MOV_IMM64_SIZE + operand_insn_size(&op))?;
        self.emit_mov_imm64(tmp, imm)?;
        self.emit_add_rr(dst, tmp)
    }

    /// ADD [addr], imm
    ///
    /// Emitted as `MOV scratch, imm; ADD [addr], scratch`, which clobbers the
    /// scratch register.
    pub fn emit_add_mi(&mut self, addr: &Operand, imm: Immediate) -> Result<()> {
        let tmp = self.scratch.gpr;
        if addr.uses_register(tmp) {
            return Err(Error::UnsupportedEncoding(format!(
                "address uses the scratch register {:?}",
                tmp
            )));
        }
        self.buffer
            .reserve(MOV_IMM64_SIZE + operand_insn_size(addr))?;
        self.emit_mov_imm64(tmp, imm)?;
        self.emit_add_mr(addr, tmp)
    }

    /// RET
    pub fn emit_ret(&mut self) -> Result<()> {
        self.buffer.emit_u8(OPCODE_RET)
    }

    /// Emits an unconditional jump to `label`.
    ///
    /// Jumps always use the rel32 form. A short jump to a label that is not
    /// bound yet cannot be patched in a single byte, so it is promoted.
    pub fn emit_jmp(&mut self, label: &mut Label, distance: JumpDistance) -> Result<()> {
        label.check_owner(self.id)?;
        self.buffer.reserve(JMP_REL32_SIZE)?;
        if distance == JumpDistance::Short && !label.is_bound() {
            debug!(
                "Promoting short jump at offset {} to rel32 (label not bound)",
                self.size()
            );
        }
        self.buffer.emit_u8(OPCODE_JMP_REL32)?;
        self.emit_label(label, 4)
    }

    /// Binds `label` to the current position and patches its pending
    /// references.
    ///
    /// Fails without touching the code if the label is already bound or
    /// was linked by another assembler.
    pub fn bind(&mut self, label: &mut Label) -> Result<()> {
        let was_linked = label.is_linked();
        label.bind(self.id, &mut self.buffer)?;
        // Only this assembler can link a label it owns, so it was counted.
        if was_linked {
            self.unresolved_labels -= 1;
        }
        Ok(())
    }

    /// Copies the code into executable memory.
    ///
    /// Fails if any referenced label was never bound.
    pub fn compile(&self) -> Result<ExecutableCode> {
        if self.unresolved_labels > 0 {
            return Err(Error::InvalidLabelUse(format!(
                "{} referenced label(s) never bound",
                self.unresolved_labels
            )));
        }
        ExecutableCode::new(self.code())
    }

    /// Emits a 4-byte displacement to `label` followed by `trailing - 4`
    /// more instruction bytes.
    fn emit_label(&mut self, label: &mut Label, trailing: usize) -> Result<()> {
        let was_unbound = label.is_unbound();
        label.emit_reference(self.id, &mut self.buffer, trailing)?;
        if was_unbound && label.is_linked() {
            self.unresolved_labels += 1;
        }
        Ok(())
    }

    /// REX.W + opcode + ModRM(reg, op)
    fn emit_operand_insn(&mut self, opcode: u8, reg: Register, op: &Operand) -> Result<()> {
        self.buffer.reserve(operand_insn_size(op))?;
        self.emit_operand_rex(reg, op, REX_W)?;
        self.buffer.emit_u8(opcode)?;
        self.emit_operand(reg.low_bits(), op)
    }

    fn emit_operand_rex(&mut self, reg: Register, op: &Operand, rex: u8) -> Result<()> {
        let mut rex = rex | op.rex();
        if reg.is_extended() {
            rex |= REX_R;
        }
        self.emit_rex(rex)
    }

    fn emit_register_rex(&mut self, reg: Register, rex: u8) -> Result<()> {
        let mut rex = rex;
        if reg.is_extended() {
            rex |= REX_B;
        }
        self.emit_rex(rex)
    }

    fn emit_rex(&mut self, rex: u8) -> Result<()> {
        if rex != REX_NONE {
            self.buffer.emit_u8(REX_PREFIX | rex)?;
        }
        Ok(())
    }

    /// Emits the operand bytes with `reg_field` in ModRM.reg
    fn emit_operand(&mut self, reg_field: u8, op: &Operand) -> Result<()> {
        let bytes = op.as_bytes();
        self.buffer.emit_u8(bytes[0] | (reg_field << 3))?;
        self.buffer.emit_bytes(&bytes[1..])
    }
}

/// Size of a REX.W instruction with a one-byte opcode and operand `op`
fn operand_insn_size(op: &Operand) -> usize {
    2 + op.len()
}
