use zeroize::Zeroize;

#[derive(PartialEq, Debug)]
#[repr(C)]
pub enum CbkeBufferError {
    BufferAlreadyFull,
    SliceTooLong,
}

/// A fixed-size (but parameterized) buffer for certificates, keys and message payloads.
///
/// Only the first `len` bytes are meaningful. The buffer is wiped on [`Zeroize::zeroize`], which
/// the stores use whenever they release partner material.
#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Zeroize)]
pub struct CbkeBuffer<const N: usize> {
    pub content: [u8; N],
    pub len: usize,
}

impl<const N: usize> Default for CbkeBuffer<N> {
    fn default() -> Self {
        CbkeBuffer {
            content: [0; N],
            len: 0,
        }
    }
}

impl<const N: usize> CbkeBuffer<N> {
    pub const fn new() -> Self {
        CbkeBuffer {
            content: [0u8; N],
            len: 0,
        }
    }

    pub fn new_from_slice(slice: &[u8]) -> Result<Self, CbkeBufferError> {
        let mut buffer = Self::new();
        if buffer.fill_with_slice(slice).is_ok() {
            Ok(buffer)
        } else {
            Err(CbkeBufferError::SliceTooLong)
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    pub fn push(&mut self, item: u8) -> Result<(), CbkeBufferError> {
        if self.len < self.capacity() {
            self.content[self.len] = item;
            self.len += 1;
            Ok(())
        } else {
            Err(CbkeBufferError::BufferAlreadyFull)
        }
    }

    pub fn get_slice(&self, start: usize, len: usize) -> Option<&[u8]> {
        self.as_slice().get(start..start.checked_add(len)?)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[0..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.content[0..self.len]
    }

    pub fn fill_with_slice(&mut self, slice: &[u8]) -> Result<(), CbkeBufferError> {
        if slice.len() <= self.capacity() {
            self.len = slice.len();
            self.content[..self.len].copy_from_slice(slice);
            Ok(())
        } else {
            Err(CbkeBufferError::SliceTooLong)
        }
    }

    pub fn extend_from_slice(&mut self, slice: &[u8]) -> Result<(), CbkeBufferError> {
        if self.len + slice.len() <= self.content.len() {
            self.content[self.len..self.len + slice.len()].copy_from_slice(slice);
            self.len += slice.len();
            Ok(())
        } else {
            Err(CbkeBufferError::SliceTooLong)
        }
    }

    /// Shortens the buffer, wiping the bytes that are cut off. Has no effect if `len` is not
    /// shorter than the current length.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.content[len..self.len].zeroize();
            self.len = len;
        }
    }
}
