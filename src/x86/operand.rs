//! Register and memory operands.
//!
//! An operand is the ModRM byte, an optional SIB byte and an optional
//! displacement, plus the REX.B/REX.X bits those bytes need. The ModRM reg
//! field is left zero; the emitter fills it in together with REX.R.
//!
//! See: Intel SDM Volume 2, Section 2.1.5 Addressing-Mode Encoding of ModR/M
//! and SIB Bytes, and Section 2.2.1.2 More on REX Prefix Fields.

use super::registers::{REX_B, REX_NONE, REX_X, Register, ScaleFactor};
use crate::{Error, Result};

/// Immediate values are consumed directly at emission time
pub type Immediate = i64;

/// Memory operand built by one of the address constructors
pub type Address = Operand;

/// Memory operand addressing a field of a record
pub type FieldAddress = Operand;

/// ModRM.rm (or SIB.base) low bits that require a SIB byte (RSP/R12)
const SIB_REQUIRED: u8 = 0b100;

/// Low bits that mean "disp32" at mod=0 (RBP/R13)
const DISP32_REQUIRED: u8 = 0b101;

const MAX_OPERAND_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    length: u8,
    rex: u8,
    encoding: [u8; MAX_OPERAND_LEN],
}

impl Operand {
    fn empty() -> Self {
        Self {
            length: 0,
            rex: REX_NONE,
            encoding: [0; MAX_OPERAND_LEN],
        }
    }

    /// Register-direct operand (mod=3)
    pub fn register(reg: Register) -> Operand {
        let mut op = Self::empty();
        if reg.is_extended() {
            op.rex |= REX_B;
        }
        op.encoding[0] = (3 << 6) | reg.low_bits();
        op.length = 1;
        op
    }

    /// `[base + disp32]`, always with a 4-byte displacement
    pub fn base_disp32(base: Register, disp: i32) -> Address {
        let mut op = Self::empty();
        op.set_mod_rm(2, base);
        if base.low_bits() == SIB_REQUIRED {
            op.set_sib(ScaleFactor::Times1, Register::RSP, base);
        }
        op.set_disp32(disp);
        op
    }

    /// `[base + disp]`, dropping the displacement when it is zero and the
    /// base allows it
    pub fn base_disp(base: Register, disp: i32) -> Address {
        let mut op = Self::empty();
        if disp == 0 && base.low_bits() != DISP32_REQUIRED {
            op.set_mod_rm(0, base);
            if base.low_bits() == SIB_REQUIRED {
                op.set_sib(ScaleFactor::Times1, Register::RSP, base);
            }
        } else {
            op.set_mod_rm(2, base);
            if base.low_bits() == SIB_REQUIRED {
                op.set_sib(ScaleFactor::Times1, Register::RSP, base);
            }
            op.set_disp32(disp);
        }
        op
    }

    /// `[index * scale + disp32]` with no base register
    pub fn index_scaled(index: Register, scale: ScaleFactor, disp: i32) -> Result<Address> {
        check_index(index)?;
        let mut op = Self::empty();
        op.set_mod_rm(0, Register::RSP);
        // mod=0 with SIB.base=101 means no base, disp32 follows
        op.set_sib(scale, index, Register::RBP);
        op.set_disp32(disp);
        Ok(op)
    }

    /// `[base + index * scale + disp]`
    pub fn base_index_scaled(
        base: Register,
        index: Register,
        scale: ScaleFactor,
        disp: i32,
    ) -> Result<Address> {
        check_index(index)?;
        let mut op = Self::empty();
        if disp == 0 && base.low_bits() != DISP32_REQUIRED {
            op.set_mod_rm(0, Register::RSP);
            op.set_sib(scale, index, base);
        } else {
            op.set_mod_rm(2, Register::RSP);
            op.set_sib(scale, index, base);
            op.set_disp32(disp);
        }
        Ok(op)
    }

    /// Field at offset `disp` of the record `base` points to
    pub fn field(base: Register, disp: i32) -> FieldAddress {
        Self::base_disp(base, disp)
    }

    /// Field at offset `disp` of element `index` in the array `base` points to
    pub fn field_indexed(
        base: Register,
        index: Register,
        scale: ScaleFactor,
        disp: i32,
    ) -> Result<FieldAddress> {
        Self::base_index_scaled(base, index, scale, disp)
    }

    /// Memory-form ModRM. R12 as rm always comes with a SIB byte, which
    /// carries its REX.B instead.
    fn set_mod_rm(&mut self, mode: u8, rm: Register) {
        if rm.is_extended() && !(rm == Register::R12 && mode != 3) {
            self.rex |= REX_B;
        }
        self.encoding[0] = (mode << 6) | rm.low_bits();
        self.length = 1;
    }

    fn set_sib(&mut self, scale: ScaleFactor, index: Register, base: Register) {
        if base.is_extended() {
            self.rex |= REX_B;
        }
        if index.is_extended() {
            self.rex |= REX_X;
        }
        self.encoding[1] = ((scale as u8) << 6) | (index.low_bits() << 3) | base.low_bits();
        self.length = 2;
    }

    fn set_disp32(&mut self, disp: i32) {
        let start = self.length as usize;
        self.encoding[start..start + 4].copy_from_slice(&disp.to_le_bytes());
        self.length += 4;
    }

    /// Number of encoded bytes (1 to 6)
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// REX.B/REX.X bits required by this operand
    pub fn rex(&self) -> u8 {
        self.rex
    }

    /// ModRM (reg field zero), SIB and displacement bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoding[..self.len()]
    }

    /// ModRM.mod
    pub fn mode(&self) -> u8 {
        (self.encoding[0] >> 6) & 3
    }

    /// ModRM.rm extended with REX.B
    pub fn rm(&self) -> u8 {
        ((self.rex & REX_B) << 3) | (self.encoding[0] & 7)
    }

    fn has_sib(&self) -> bool {
        self.mode() != 3 && self.encoding[0] & 7 == SIB_REQUIRED
    }

    /// The register of a register-direct operand
    pub fn register_operand(&self) -> Option<Register> {
        if self.mode() == 3 {
            Register::from_code(self.rm())
        } else {
            None
        }
    }

    pub fn is_register(&self, reg: Register) -> bool {
        self.register_operand() == Some(reg)
    }

    /// Base register of a memory operand
    pub fn base(&self) -> Option<Register> {
        match self.mode() {
            3 => None,
            mode if self.has_sib() => {
                let bits = self.encoding[1] & 7;
                if mode == 0 && bits == DISP32_REQUIRED {
                    None
                } else {
                    Register::from_code(((self.rex & REX_B) << 3) | bits)
                }
            }
            0 if self.encoding[0] & 7 == DISP32_REQUIRED => None,
            _ => Register::from_code(self.rm()),
        }
    }

    /// Index register of a memory operand
    pub fn index(&self) -> Option<Register> {
        if !self.has_sib() {
            return None;
        }
        let code = ((self.rex & REX_X) << 2) | ((self.encoding[1] >> 3) & 7);
        if code == Register::RSP.code() {
            None
        } else {
            Register::from_code(code)
        }
    }

    /// Scale of the index register
    pub fn scale(&self) -> Option<ScaleFactor> {
        self.index()
            .map(|_| ScaleFactor::from_bits(self.encoding[1] >> 6))
    }

    /// Displacement of a memory operand (zero when none is encoded)
    pub fn displacement(&self) -> i32 {
        let start = if self.has_sib() { 2 } else { 1 };
        match self.len() - start {
            1 => self.encoding[start] as i8 as i32,
            4 => i32::from_le_bytes([
                self.encoding[start],
                self.encoding[start + 1],
                self.encoding[start + 2],
                self.encoding[start + 3],
            ]),
            _ => 0,
        }
    }

    /// Whether computing this operand reads `reg`
    pub fn uses_register(&self, reg: Register) -> bool {
        self.is_register(reg) || self.base() == Some(reg) || self.index() == Some(reg)
    }
}

/// SIB.index=100 without REX.X means "no index", so RSP cannot be one.
fn check_index(index: Register) -> Result<()> {
    if index == Register::RSP {
        return Err(Error::UnsupportedEncoding(
            "RSP cannot be used as an index register".to_string(),
        ));
    }
    Ok(())
}
