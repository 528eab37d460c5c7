//! Secret key storage
//!
//! Key values held by the software backends live in [`SecureMemory`], which
//! zeroizes on drop and never prints its contents.

use std::fmt;
use zeroize::Zeroizing;

use crate::{HalError, HalResult};

/// Heap buffer for key material with automatic zeroization
#[derive(Clone, PartialEq, Eq)]
pub struct SecureMemory {
    buffer: Zeroizing<Vec<u8>>,
}

impl SecureMemory {
    /// Allocate a zero-filled buffer
    pub fn new(size: usize) -> Self {
        SecureMemory {
            buffer: Zeroizing::new(vec![0u8; size]),
        }
    }

    /// Copy `data` into a fresh buffer
    pub fn from_slice(data: &[u8]) -> Self {
        SecureMemory {
            buffer: Zeroizing::new(data.to_vec()),
        }
    }

    /// Get mutable reference to buffer
    pub fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Get immutable reference to buffer
    pub fn as_ref(&self) -> &[u8] {
        &self.buffer
    }

    /// Buffer length
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Sub-range `[offset, offset + len)` as a new buffer
    pub fn slice(&self, offset: usize, len: usize) -> HalResult<SecureMemory> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(|| {
                HalError::InvalidParameter(format!(
                    "range {}+{} outside {} byte key",
                    offset,
                    len,
                    self.buffer.len()
                ))
            })?;
        Ok(Self::from_slice(&self.buffer[offset..end]))
    }
}

impl fmt::Debug for SecureMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureMemory({} bytes)", self.buffer.len())
    }
}
