use alloc::{sync::Arc, vec, vec::Vec};

use spin::{Mutex, MutexGuard};

use crate::layout::BLOCK_SIZE;

/// A growable run of whole blocks in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockBuffer {
    data: Vec<u8>,
}

impl BlockBuffer {
    #[must_use]
    pub fn new(block_count: usize) -> Self {
        Self {
            data: vec![0; block_count * BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.data.len() / BLOCK_SIZE
    }

    /// Grows the buffer to at least `block_count` blocks; new blocks are
    /// zeroed. Never shrinks.
    pub fn grow(&mut self, block_count: usize) {
        let len = block_count * BLOCK_SIZE;
        if len > self.data.len() {
            self.data.resize(len, 0);
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn block(&self, index: usize) -> &[u8] {
        &self.data[index * BLOCK_SIZE..][..BLOCK_SIZE]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.data[index * BLOCK_SIZE..][..BLOCK_SIZE]
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// A [`BlockBuffer`] shared between a [`ReadBatch`](crate::ReadBatch) and
/// the component that consumes the loaded data.
#[derive(Debug, Default, Clone)]
pub struct SharedBuffer(Arc<Mutex<BlockBuffer>>);

impl SharedBuffer {
    #[must_use]
    pub fn new(block_count: usize) -> Self {
        Self(Arc::new(Mutex::new(BlockBuffer::new(block_count))))
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockBuffer> {
        self.0.lock()
    }

    /// Takes the contents out, leaving an empty buffer behind.
    #[must_use]
    pub fn take(&self) -> BlockBuffer {
        core::mem::take(&mut *self.0.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_keeps_contents() {
        let mut buffer = BlockBuffer::new(1);
        buffer.block_mut(0)[5] = 9;
        buffer.grow(3);
        assert_eq!(buffer.block_count(), 3);
        assert_eq!(buffer.block(0)[5], 9);
        assert!(buffer.block(2).iter().all(|b| *b == 0));

        buffer.grow(1);
        assert_eq!(buffer.block_count(), 3);
    }

    #[test]
    fn test_shared_take() {
        let shared = SharedBuffer::new(2);
        shared.lock().block_mut(1)[0] = 1;
        let clone = shared.clone();
        let taken = clone.take();
        assert_eq!(taken.block(1)[0], 1);
        assert_eq!(shared.lock().block_count(), 0);
    }
}
