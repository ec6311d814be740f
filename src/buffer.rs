//! Growable read buffer for the AMI reader

use crate::constants::{BUF_CHUNK, MAX_BUFFER_SIZE};
use crate::error::{AmiError, AmiResult};

/// Byte buffer with a read cursor.
///
/// Data is appended at the end and consumed from `position`. Consumed bytes
/// are reclaimed lazily by [`compact`](Self::compact).
#[derive(Debug)]
pub(crate) struct AmiBuffer {
    data: Vec<u8>,
    position: usize,
}

impl AmiBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    /// Unconsumed bytes.
    pub(crate) fn data(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.compact();
            let needed = bytes
                .len()
                .max(BUF_CHUNK);
            self.data
                .reserve(needed);
        }
        self.data
            .extend_from_slice(bytes);
    }

    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(AmiError::protocol_error(format!(
                "Buffer size {} exceeds limit {}",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Offset of the first occurrence of `pattern` in the unconsumed data.
    pub(crate) fn find(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || self.len() < pattern.len() {
            return None;
        }
        self.data()
            .windows(pattern.len())
            .position(|w| w == pattern)
    }

    /// Take `len` bytes and then skip `skip` more (the terminator).
    pub(crate) fn take(&mut self, len: usize, skip: usize) -> Vec<u8> {
        let start = self.position;
        let end = start + len;
        let out = self.data[start..end].to_vec();
        self.position = (end + skip).min(self.data.len());
        out
    }

    /// Take everything up to `pattern`, consuming the pattern as well.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find(pattern)?;
        Some(self.take(pos, pattern.len()))
    }

    /// Drop consumed bytes from the front of the allocation.
    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.data
            .drain(..self.position);
        self.position = 0;
    }
}
