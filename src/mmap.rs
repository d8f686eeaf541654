//! Executable memory mappings.
//!
//! Finished code is copied into an anonymous, private mapping with read,
//! write and execute permission. The mapping is owned by an
//! [`ExecutableCode`] handle and released when the handle is dropped.

use crate::{MappingError, Result};
use tracing::{debug, trace};

/// Code copied into executable memory.
#[derive(Debug)]
pub struct ExecutableCode {
    addr: *mut libc::c_void,
    size: usize,
}

// The mapping is never written after construction.
unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

impl ExecutableCode {
    /// Maps `code.len()` bytes of executable memory and copies `code` into it.
    pub fn new(code: &[u8]) -> Result<ExecutableCode> {
        let size = code.len();
        if size == 0 {
            return Err(MappingError::Empty.into());
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            debug!("Failed to map {} bytes of executable memory: {}", size, err);
            return Err(classify(err).into());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, size);
        }
        crate::x86::flush_icache_range(addr as *const u8, size);
        trace!("Mapped {} bytes of code at {:p}", size, addr);
        Ok(Self { addr, size })
    }

    /// Returns the entry point, the first byte of the code.
    ///
    /// Transmute it to an `extern "C" fn` type matching the calling
    /// convention the emitted code follows before calling it.
    pub fn entry(&self) -> *const u8 {
        self.addr as *const u8
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the mapped code
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
    }

    /// Unmap the code.
    fn unmap(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.size);
        }
        trace!("Unmapped {} bytes of code at {:p}", self.size, self.addr);
    }
}

impl Drop for ExecutableCode {
    fn drop(&mut self) {
        self.unmap();
    }
}

fn classify(err: std::io::Error) -> MappingError {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => MappingError::PermissionDenied(err),
        Some(libc::ENOMEM) | Some(libc::EAGAIN) => MappingError::ResourceExhausted(err),
        _ => MappingError::Os(err),
    }
}
