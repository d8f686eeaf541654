//! x86-64 register and encoding constants.
//!
//! Register codes are the hardware numbers: the low 3 bits go into a ModRM
//! or SIB field and bit 3 is carried by a REX prefix bit.

/// REX prefix base value (0100_WRXB)
pub const REX_PREFIX: u8 = 0x40;

pub const REX_NONE: u8 = 0b0000_0000;

/// 64-bit operand size
pub const REX_W: u8 = 0b0000_1000;

/// Extends ModRM.reg
pub const REX_R: u8 = 0b0000_0100;

/// Extends SIB.index
pub const REX_X: u8 = 0b0000_0010;

/// Extends ModRM.rm or SIB.base
pub const REX_B: u8 = 0b0000_0001;

/// General-purpose 64-bit registers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Register {
    pub const ALL: [Register; 16] = [
        Register::RAX,
        Register::RCX,
        Register::RDX,
        Register::RBX,
        Register::RSP,
        Register::RBP,
        Register::RSI,
        Register::RDI,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// Returns the register with hardware number `code`
    pub fn from_code(code: u8) -> Option<Register> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// The 3 bits encoded in ModRM/SIB
    pub fn low_bits(self) -> u8 {
        self as u8 & 7
    }

    /// Whether the register needs a REX extension bit (R8-R15)
    pub fn is_extended(self) -> bool {
        self as u8 > 7
    }
}

/// SSE registers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuRegister {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl FpuRegister {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn low_bits(self) -> u8 {
        self as u8 & 7
    }

    pub fn is_extended(self) -> bool {
        self as u8 > 7
    }
}

/// SIB scale factor
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleFactor {
    Times1 = 0b00,
    Times2 = 0b01,
    Times4 = 0b10,
    Times8 = 0b11,
}

impl ScaleFactor {
    pub const ALL: [ScaleFactor; 4] = [
        ScaleFactor::Times1,
        ScaleFactor::Times2,
        ScaleFactor::Times4,
        ScaleFactor::Times8,
    ];

    /// Decodes the 2-bit SIB field
    pub fn from_bits(bits: u8) -> ScaleFactor {
        Self::ALL[(bits & 3) as usize]
    }

    /// The multiplier, 1, 2, 4 or 8
    pub fn value(self) -> u32 {
        1 << self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_codes() {
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.code() as usize, i);
            assert_eq!(Register::from_code(i as u8), Some(*reg));
            assert_eq!(reg.low_bits() as usize, i & 7);
            assert_eq!(reg.is_extended(), i >= 8);
        }
        assert_eq!(Register::from_code(16), None);
    }

    #[test]
    fn fpu_register_codes() {
        assert_eq!(FpuRegister::XMM0.code(), 0);
        assert_eq!(FpuRegister::XMM13.low_bits(), 5);
        assert!(FpuRegister::XMM8.is_extended());
        assert!(!FpuRegister::XMM7.is_extended());
    }

    #[test]
    fn scale_factors() {
        let values: Vec<u32> = ScaleFactor::ALL.iter().map(|s| s.value()).collect();
        assert_eq!(values, vec![1, 2, 4, 8]);
        assert_eq!(ScaleFactor::from_bits(0b10), ScaleFactor::Times4);
    }
}
