//! x86-64 instruction encoding.
//!
//! Only 64-bit (long) mode is supported, and only the handful of
//! instructions a runtime specializer needs: 64-bit immediate loads, 64-bit
//! adds between registers, memory and immediates, `ret`, and unconditional
//! jumps to labels.

mod assembler;
mod operand;
mod registers;

pub use assembler::{Assembler, AssemblerBuilder, JumpDistance, ScratchRegisters};
pub use operand::{Address, FieldAddress, Immediate, Operand};
pub use registers::{
    FpuRegister, REX_B, REX_NONE, REX_PREFIX, REX_R, REX_W, REX_X, Register, ScaleFactor,
};

/// Flush the instruction cache for the given range
pub fn flush_icache_range(_start: *const u8, _size: usize) {
    // x86-64 has a coherent I-cache, only order the stores
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mfence");
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
