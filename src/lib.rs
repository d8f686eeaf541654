//! Weft - A runtime x86-64 machine code emitter.
//!
//! Weft builds native instruction sequences into a growable byte buffer and
//! turns the result into directly executable memory. It is meant for callers
//! such as compiler backends, virtual machines and specializers that want to
//! synthesize short code sequences at runtime instead of interpreting them.
//!
//! # Modules
//!
//! - [`buffer`] - Growable code buffer with offset-based patching
//! - [`label`] - Branch targets resolved through an in-buffer patch chain
//! - [`x86`] - Registers, operands and the instruction emitter
//! - [`mmap`] - Executable memory mappings for finished code
//!
//! # Example
//!
//! ```no_run
//! use weft::{Assembler, Register};
//!
//! let mut asm = Assembler::new();
//! asm.emit_mov_imm64(Register::RAX, 42)?;
//! asm.emit_ret()?;
//! let code = asm.compile()?;
//! let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(code.entry()) };
//! assert_eq!(f(), 42);
//! # Ok::<(), weft::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Encoding-time misuse
//! (buffer overflow, label misuse, unencodable operands) and the one
//! environmental failure, creating the executable mapping, are all reported
//! as typed errors.

pub mod buffer;
pub mod label;
pub mod mmap;
pub mod x86;

/// Consolidated error type for all Weft operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("buffer overflow: {width} bytes at offset {offset} exceed limit {limit}")]
    BufferOverflow {
        offset: usize,
        width: usize,
        limit: usize,
    },

    #[error("invalid label use: {0}")]
    InvalidLabelUse(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("executable mapping error: {0}")]
    Mapping(#[from] MappingError),
}

/// Error type for creating executable memory mappings
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("permission denied: {0}")]
    PermissionDenied(std::io::Error),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(std::io::Error),

    #[error("mmap failed: {0}")]
    Os(std::io::Error),

    #[error("cannot map an empty code buffer")]
    Empty,
}

pub type Result<T> = core::result::Result<T, Error>;

pub use buffer::CodeBuffer;
pub use label::Label;
pub use mmap::ExecutableCode;
pub use x86::{
    Address, Assembler, AssemblerBuilder, FieldAddress, FpuRegister, Immediate, JumpDistance,
    Operand, Register, ScaleFactor, ScratchRegisters,
};
