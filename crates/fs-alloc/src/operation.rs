//! Buffered block operations collected by transactions, and batched reads
//! used while loading.

use alloc::vec::Vec;

use derive_more::{Display, IsVariant};
use log::trace;

use crate::{
    buffer::SharedBuffer,
    device::{BlockDevice, DeviceError},
    layout::BLOCK_SIZE,
    node::Node,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
pub enum OperationKind {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("trim")]
    Trim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{kind} {dev_block}+{block_count}")]
pub struct Operation {
    pub kind: OperationKind,
    pub dev_block: u64,
    pub block_count: u64,
}

impl Operation {
    fn overlaps(&self, other: &Self) -> bool {
        self.dev_block < other.dev_block + other.block_count
            && other.dev_block < self.dev_block + self.block_count
    }
}

/// An operation together with the bytes it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedOperation {
    pub op: Operation,
    pub data: Vec<u8>,
}

impl BufferedOperation {
    /// # Panics
    ///
    /// Panics if `data` is empty or not a whole number of blocks.
    #[must_use]
    pub fn write(dev_block: u64, data: Vec<u8>) -> Self {
        assert!(
            !data.is_empty() && data.len() % BLOCK_SIZE == 0,
            "write of {} bytes is not a whole number of blocks",
            data.len()
        );
        Self {
            op: Operation {
                kind: OperationKind::Write,
                dev_block,
                block_count: (data.len() / BLOCK_SIZE) as u64,
            },
            data,
        }
    }

    #[must_use]
    pub fn trim(dev_block: u64, block_count: u64) -> Self {
        Self {
            op: Operation {
                kind: OperationKind::Trim,
                dev_block,
                block_count,
            },
            data: Vec::new(),
        }
    }
}

/// Sink for the operations produced while a transaction is open.
pub trait PendingWork {
    fn enqueue_metadata(&mut self, op: BufferedOperation);
    fn enqueue_data(&mut self, op: BufferedOperation);

    /// Called with the image inode slot `ino` held before the in-memory
    /// table was overwritten.
    fn record_node(&mut self, _ino: u32, _previous: &Node) {}
}

/// Ordered metadata and data operation lists.
///
/// A metadata write whose device range equals that of the most recent
/// overlapping metadata write replaces it in place, so only the newest image
/// of a block is written.
#[derive(Debug, Default)]
pub struct OperationQueue {
    metadata: Vec<BufferedOperation>,
    data: Vec<BufferedOperation>,
}

impl OperationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metadata(&self) -> &[BufferedOperation] {
        &self.metadata
    }

    #[must_use]
    pub fn data(&self) -> &[BufferedOperation] {
        &self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.data.is_empty()
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<BufferedOperation>, Vec<BufferedOperation>) {
        (self.metadata, self.data)
    }
}

impl PendingWork for OperationQueue {
    fn enqueue_metadata(&mut self, op: BufferedOperation) {
        if op.op.kind.is_write()
            && let Some(latest) = self
                .metadata
                .iter_mut()
                .rev()
                .find(|queued| queued.op.overlaps(&op.op))
            && latest.op == op.op
        {
            trace!("replacing queued metadata {}", op.op);
            latest.data = op.data;
            return;
        }
        self.metadata.push(op);
    }

    fn enqueue_data(&mut self, op: BufferedOperation) {
        self.data.push(op);
    }
}

#[derive(Debug)]
struct ReadRequest {
    dev_block: u64,
    block_count: usize,
    buffer: SharedBuffer,
    buffer_block: usize,
}

/// Reads scheduled while loading, run in one go by the caller.
#[derive(Debug, Default)]
pub struct ReadBatch {
    requests: Vec<ReadRequest>,
}

impl ReadBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a read of `block_count` device blocks starting at
    /// `dev_block` into `buffer`, starting at block `buffer_block`.
    pub fn add(
        &mut self,
        dev_block: u64,
        block_count: usize,
        buffer: &SharedBuffer,
        buffer_block: usize,
    ) {
        self.requests.push(ReadRequest {
            dev_block,
            block_count,
            buffer: buffer.clone(),
            buffer_block,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Issues every scheduled read against `device`, growing target buffers
    /// as needed.
    pub fn run(self, device: &dyn BlockDevice) -> Result<(), DeviceError> {
        for request in self.requests {
            if request.block_count == 0 {
                continue;
            }
            let mut buffer = request.buffer.lock();
            buffer.grow(request.buffer_block + request.block_count);
            let bytes = &mut buffer.as_bytes_mut()[request.buffer_block * BLOCK_SIZE..]
                [..request.block_count * BLOCK_SIZE];
            trace!(
                "reading {} blocks at {} into buffer block {}",
                request.block_count, request.dev_block, request.buffer_block
            );
            device.read_blocks(request.dev_block, bytes)?;
        }
        Ok(())
    }
}
