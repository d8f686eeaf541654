//! Growable code buffer.
//!
//! The buffer tracks a cursor (the next write position) and a limit. Every
//! write checks that it fits below the limit and grows the storage
//! geometrically when it does not. Positions inside the buffer are always
//! handed out as offsets from the base, so growth may move the storage
//! without invalidating outstanding patch sites.

use crate::{Error, Result};
use tracing::trace;

/// Spare bytes reserved past the limit.
pub const MIN_GAP: usize = 32;

/// Capacity used by [`CodeBuffer::default`].
pub const DEFAULT_INITIAL_CAPACITY: usize = 4096;

/// Patch sites hold signed 32-bit offsets, so code never grows past this.
pub const MAX_CAPACITY: usize = i32::MAX as usize;

/// Growable byte store for emitted code
#[derive(Debug)]
pub struct CodeBuffer {
    /// Bytes written so far; the cursor is `contents.len()`
    contents: Vec<u8>,
    /// Writes must end at or below this offset
    limit: usize,
    /// Growth ceiling
    max_capacity: usize,
}

impl CodeBuffer {
    /// Allocates a buffer with room for `initial_capacity` bytes that may
    /// grow up to `max_capacity` bytes.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Result<Self> {
        let max_capacity = max_capacity.min(MAX_CAPACITY);
        let limit = initial_capacity.min(max_capacity);
        let mut contents = Vec::new();
        contents
            .try_reserve_exact(limit + MIN_GAP)
            .map_err(|e| Error::AllocationFailure(e.to_string()))?;
        Ok(Self {
            contents,
            limit,
            max_capacity,
        })
    }

    /// Returns the number of bytes emitted so far
    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// Returns the current write limit
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Returns the bytes emitted so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }

    /// Emit a single byte
    pub fn emit_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.contents.push(value);
        Ok(())
    }

    /// Emit a little-endian 32-bit value
    pub fn emit_i32(&mut self, value: i32) -> Result<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit a little-endian 64-bit value
    pub fn emit_i64(&mut self, value: i64) -> Result<()> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.contents.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads the 4-byte value at `offset`, which must already be written.
    pub fn load_i32(&self, offset: usize) -> Result<i32> {
        let range = self.site(offset)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.contents[range]);
        Ok(i32::from_le_bytes(bytes))
    }

    /// Overwrites the 4-byte value at `offset`, which must already be written.
    pub fn store_i32(&mut self, offset: usize, value: i32) -> Result<()> {
        let range = self.site(offset)?;
        self.contents[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn site(&self, offset: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(4) {
            Some(end) if end <= self.size() => Ok(offset..end),
            _ => Err(Error::BufferOverflow {
                offset,
                width: 4,
                limit: self.size(),
            }),
        }
    }

    /// Makes room for a write of `width` bytes at the cursor, growing the
    /// storage if needed.
    pub fn reserve(&mut self, width: usize) -> Result<()> {
        let cursor = self.size();
        let end = cursor.saturating_add(width);
        if end <= self.limit {
            return Ok(());
        }
        if end > self.max_capacity {
            return Err(Error::BufferOverflow {
                offset: cursor,
                width,
                limit: self.max_capacity,
            });
        }
        let mut new_limit = self.limit.max(1);
        while new_limit < end {
            new_limit = new_limit.saturating_mul(2);
        }
        let new_limit = new_limit.min(self.max_capacity);
        self.contents
            .try_reserve_exact(new_limit + MIN_GAP - cursor)
            .map_err(|e| Error::AllocationFailure(e.to_string()))?;
        trace!(
            "Code buffer grown from {} to {} bytes",
            self.limit, new_limit
        );
        self.limit = new_limit;
        Ok(())
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self {
            contents: Vec::with_capacity(DEFAULT_INITIAL_CAPACITY + MIN_GAP),
            limit: DEFAULT_INITIAL_CAPACITY,
            max_capacity: MAX_CAPACITY,
        }
    }
}
