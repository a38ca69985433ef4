use alloc::boxed::Box;

use log::trace;
use snafu::ensure;
use spin::RwLock;

use crate::{
    allocator::{Allocator, AllocatorLoader},
    buffer::{BlockBuffer, SharedBuffer},
    error::{FsError, InvalidArgumentSnafu, IoDataIntegritySnafu},
    layout::{INODE_SIZE, inode_position, inode_table_blocks},
    node::{Inode, Node, NodeFinder},
    operation::{BufferedOperation, PendingWork, ReadBatch},
    storage::AllocatorStorage,
};

/// Owns the inode allocator and the in-memory copy of the inode table.
///
/// The table grows on demand when the inode pool is extended; slots past
/// the loaded table read as free nodes.
#[derive(Debug)]
pub struct InodeManager {
    allocator: Allocator,
    start_block: u64,
    table: RwLock<BlockBuffer>,
}

/// An inode manager whose bitmap and table reads are scheduled.
pub struct InodeManagerLoader {
    allocator: AllocatorLoader,
    start_block: u64,
    table: SharedBuffer,
}

impl InodeManagerLoader {
    #[must_use]
    pub fn finish(self) -> InodeManager {
        InodeManager {
            allocator: self.allocator.finish(),
            start_block: self.start_block,
            table: RwLock::new(self.table.take()),
        }
    }
}

impl InodeManager {
    /// Schedules the loads of the inode bitmap and of the table starting at
    /// `start_block`.
    pub fn create(
        batch: &mut ReadBatch,
        storage: Box<dyn AllocatorStorage>,
        start_block: u64,
    ) -> InodeManagerLoader {
        let blocks = inode_table_blocks(storage.pool_total());
        let allocator = Allocator::create(batch, storage);
        let table = SharedBuffer::new(blocks);
        batch.add(start_block, blocks, &table, 0);
        InodeManagerLoader {
            allocator,
            start_block,
            table,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.allocator.pool_total()
    }

    fn check(&self, ino: u32) -> Result<(), FsError> {
        let count = self.inode_count();
        ensure!(
            (ino as usize) < count,
            InvalidArgumentSnafu {
                what: "inode number",
                value: u64::from(ino),
                limit: count as u64,
            }
        );
        Ok(())
    }

    /// Reads inode `ino` from the table.
    pub fn load(&self, ino: u32) -> Result<Inode, FsError> {
        match self.get_node(ino)? {
            Node::Inode(inode) => Ok(inode),
            Node::Container(_) => IoDataIntegritySnafu {
                node: ino,
                reason: "expected an inode, found an extent container",
            }
            .fail(),
        }
    }

    /// Stores `inode` and enqueues its table block.
    pub fn update(
        &self,
        work: &mut dyn PendingWork,
        ino: u32,
        inode: &Inode,
    ) -> Result<(), FsError> {
        self.update_node(work, ino, &Node::Inode(*inode))
    }

    /// Stores any node and enqueues its table block.
    pub fn update_node(
        &self,
        work: &mut dyn PendingWork,
        ino: u32,
        node: &Node,
    ) -> Result<(), FsError> {
        self.check(ino)?;
        let (block, offset) = inode_position(ino);
        let mut table = self.table.write();
        table.grow(block + 1);
        let data = table.block_mut(block);
        work.record_node(ino, &Node::decode(&data[offset..]));
        node.encode(&mut data[offset..offset + INODE_SIZE]);
        trace!("updated node {ino} in table block {block}");
        work.enqueue_metadata(BufferedOperation::write(
            self.start_block + block as u64,
            data.to_vec(),
        ));
        Ok(())
    }

    /// Writes `node` back into the in-memory table without scheduling any
    /// device write.
    pub(crate) fn restore_node(&self, ino: u32, node: &Node) {
        let (block, offset) = inode_position(ino);
        let mut table = self.table.write();
        if block < table.block_count() {
            node.encode(&mut table.block_mut(block)[offset..offset + INODE_SIZE]);
        }
    }
}

impl NodeFinder for InodeManager {
    fn get_node(&self, index: u32) -> Result<Node, FsError> {
        self.check(index)?;
        let (block, offset) = inode_position(index);
        let table = self.table.read();
        if block >= table.block_count() {
            return Ok(Node::free());
        }
        Ok(Node::decode(&table.block(block)[offset..]))
    }
}
