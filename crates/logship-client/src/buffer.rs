//! Fixed-capacity byte accumulator for one stream

use bytes::{Bytes, BytesMut};

/// Byte buffer for a single stream key
///
/// Appends are all-or-nothing: [`StreamBuffer::try_put`] either copies the
/// whole slice or leaves the buffer untouched.
#[derive(Debug)]
pub struct StreamBuffer {
    capacity: usize,
    data: BytesMut,
}

impl StreamBuffer {
    /// Create an empty buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space left
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Check whether `len` more bytes fit
    pub fn fits(&self, len: usize) -> bool {
        len <= self.remaining()
    }

    /// Append `bytes` if they fit entirely; returns false otherwise
    pub fn try_put(&mut self, bytes: &[u8]) -> bool {
        if !self.fits(bytes.len()) {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    /// Copy the contents out and reset the buffer
    pub fn take(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self.data);
        self.data.clear();
        out
    }

    /// View the buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
