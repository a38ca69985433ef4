//! Atomic units of metadata mutation.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::{any::Any, mem};

use log::{debug, error, warn};
use snafu::ensure;
use snafu_utils::Report;
use spin::MutexGuard;

use crate::{
    allocator::{Allocator, AllocatorReservation},
    error::{FsError, IoDataIntegritySnafu, ReadOnlySnafu},
    extent::{AllocatedExtentIterator, NodePopulator},
    fs::Filesystem,
    node::{Extent, Inode, Node},
    operation::{BufferedOperation, OperationQueue, PendingWork},
};

/// Queued operations plus the prior image of every inode table slot the
/// transaction has overwritten.
#[derive(Default)]
struct Journal {
    queue: OperationQueue,
    previous: BTreeMap<u32, Node>,
}

impl PendingWork for Journal {
    fn enqueue_metadata(&mut self, op: BufferedOperation) {
        self.queue.enqueue_metadata(op);
    }

    fn enqueue_data(&mut self, op: BufferedOperation) {
        self.queue.enqueue_data(op);
    }

    fn record_node(&mut self, ino: u32, previous: &Node) {
        self.previous.entry(ino).or_insert(*previous);
    }
}

/// One atomic unit of work against a [`Filesystem`].
///
/// A transaction holds the filesystem's writer lock from creation until it
/// is committed or dropped, so at most one exists per filesystem. Dropping
/// it without [`commit`](Self::commit) cancels its reservations, discards
/// its operations and puts back the inode table slots it overwrote.
pub struct Transaction<'fs> {
    fs: &'fs Filesystem,
    inode_reservation: Option<AllocatorReservation<'fs>>,
    block_reservation: Option<AllocatorReservation<'fs>>,
    journal: Journal,
    pinned: Vec<Arc<dyn Any + Send + Sync>>,
    _writer: MutexGuard<'fs, ()>,
}

impl<'fs> Transaction<'fs> {
    /// Takes the writer lock and reserves the requested elements.
    ///
    /// On failure nothing stays reserved and the lock is released.
    pub fn create(
        fs: &'fs Filesystem,
        reserve_inodes: usize,
        reserve_blocks: usize,
    ) -> Result<Self, FsError> {
        ensure!(!fs.is_read_only(), ReadOnlySnafu);
        let writer = fs.writer_lock().lock();
        ensure!(!fs.is_read_only(), ReadOnlySnafu);
        let mut transaction = Self {
            fs,
            inode_reservation: None,
            block_reservation: None,
            journal: Journal::default(),
            pinned: Vec::new(),
            _writer: writer,
        };
        if reserve_inodes > 0 {
            transaction.extend_inode_reservation(reserve_inodes)?;
        }
        if reserve_blocks > 0 {
            transaction.extend_block_reservation(reserve_blocks)?;
        }
        Ok(transaction)
    }

    #[must_use]
    pub fn filesystem(&self) -> &'fs Filesystem {
        self.fs
    }

    fn reservation<'r>(
        slot: &'r mut Option<AllocatorReservation<'fs>>,
        allocator: &'fs Allocator,
    ) -> &'r mut AllocatorReservation<'fs> {
        slot.get_or_insert_with(|| AllocatorReservation::new(allocator))
    }

    pub fn extend_inode_reservation(&mut self, count: usize) -> Result<(), FsError> {
        let allocator = self.fs.inodes().allocator();
        Self::reservation(&mut self.inode_reservation, allocator).reserve(&mut self.journal, count)
    }

    pub fn extend_block_reservation(&mut self, count: usize) -> Result<(), FsError> {
        let allocator = self.fs.block_allocator();
        Self::reservation(&mut self.block_reservation, allocator).reserve(&mut self.journal, count)
    }

    #[must_use]
    pub fn reserved_inodes(&self) -> usize {
        self.inode_reservation
            .as_ref()
            .map_or(0, AllocatorReservation::reserved)
    }

    #[must_use]
    pub fn reserved_blocks(&self) -> usize {
        self.block_reservation
            .as_ref()
            .map_or(0, AllocatorReservation::reserved)
    }

    /// # Panics
    ///
    /// Panics if no block is left in the reservation.
    pub fn allocate_block(&mut self) -> usize {
        let Some(reservation) = self.block_reservation.as_mut() else {
            panic!("allocating a block without a block reservation");
        };
        reservation.allocate()
    }

    /// Frees `block` when the transaction commits.
    pub fn deallocate_block(&mut self, block: usize) {
        let allocator = self.fs.block_allocator();
        Self::reservation(&mut self.block_reservation, allocator).deallocate(block);
    }

    /// Allocates a replacement for `old` and frees `old` on commit.
    pub fn swap_block(&mut self, old: Option<usize>) -> usize {
        let Some(reservation) = self.block_reservation.as_mut() else {
            panic!("swapping a block without a block reservation");
        };
        reservation.swap(old)
    }

    /// # Panics
    ///
    /// Panics if no inode is left in the reservation.
    pub fn allocate_inode(&mut self) -> u32 {
        let Some(reservation) = self.inode_reservation.as_mut() else {
            panic!("allocating an inode without an inode reservation");
        };
        reservation.allocate() as u32
    }

    /// Frees inode slot `ino` when the transaction commits.
    pub fn deallocate_inode(&mut self, ino: u32) {
        let allocator = self.fs.inodes().allocator();
        Self::reservation(&mut self.inode_reservation, allocator).deallocate(ino as usize);
    }

    /// Allocates an inode and writes `inode` into it.
    pub fn create_inode(&mut self, inode: &Inode) -> Result<u32, FsError> {
        let ino = self.allocate_inode();
        self.fs.inodes().update(&mut self.journal, ino, inode)?;
        Ok(ino)
    }

    pub fn update_inode(&mut self, ino: u32, inode: &Inode) -> Result<(), FsError> {
        self.fs.inodes().update(&mut self.journal, ino, inode)
    }

    /// Writes `extents` into the empty inode `ino`, taking extent
    /// containers from the inode reservation.
    pub fn populate_inode(&mut self, ino: u32, extents: &[Extent]) -> Result<Vec<u32>, FsError> {
        let fs = self.fs;
        let inodes = fs.inodes();
        let reservation = Self::reservation(&mut self.inode_reservation, inodes.allocator());
        NodePopulator::new(inodes).populate(&mut self.journal, reservation, ino, extents)
    }

    /// Releases inode `ino` together with its extent containers and data
    /// blocks. Everything is freed on commit.
    ///
    /// The whole chain is checked against both bitmaps first; a chain that
    /// frees a free element, reaches past the block pool or frees a block
    /// twice fails with `IoDataIntegrity` and leaves the transaction as it
    /// was.
    pub fn release_inode(&mut self, ino: u32) -> Result<(), FsError> {
        let fs = self.fs;
        let inodes = fs.inodes();
        let mut iter = AllocatedExtentIterator::new(inodes, ino)?;
        let mut nodes = Vec::from([ino]);
        let mut extents = Vec::new();
        while let Some(extent) = iter.next().transpose()? {
            let node = iter.node_index();
            if nodes.last() != Some(&node) {
                nodes.push(node);
            }
            extents.push((node, extent));
        }
        check_release(fs, &nodes, &mut extents)?;

        for (_, extent) in &extents {
            for block in extent.start()..extent.end() {
                self.deallocate_block(block as usize);
            }
        }
        for &node in &nodes {
            inodes.update_node(&mut self.journal, node, &Node::free())?;
            self.deallocate_inode(node);
        }
        debug!(
            "releasing inode {ino}: {} nodes, {} extents",
            nodes.len(),
            extents.len()
        );
        Ok(())
    }

    /// Keeps `vnode` alive until the transaction ends.
    pub fn pin_vnode(&mut self, vnode: Arc<dyn Any + Send + Sync>) {
        self.pinned.push(vnode);
    }

    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    pub fn enqueue_metadata(&mut self, op: BufferedOperation) {
        self.journal.enqueue_metadata(op);
    }

    pub fn enqueue_data(&mut self, op: BufferedOperation) {
        self.journal.enqueue_data(op);
    }

    #[must_use]
    pub fn metadata_operations(&self) -> &[BufferedOperation] {
        self.journal.queue.metadata()
    }

    #[must_use]
    pub fn data_operations(&self) -> &[BufferedOperation] {
        self.journal.queue.data()
    }

    /// Finalizes both reservations and hands all operations to the
    /// filesystem's writeback.
    ///
    /// If writeback fails the filesystem turns read-only.
    pub fn commit(mut self) -> Result<(), FsError> {
        if let Some(reservation) = self.inode_reservation.as_mut() {
            reservation.commit(&mut self.journal);
        }
        if let Some(reservation) = self.block_reservation.as_mut() {
            reservation.commit(&mut self.journal);
        }
        let Journal { queue, .. } = mem::take(&mut self.journal);
        let (metadata, data) = queue.into_parts();
        debug!(
            "committing transaction: {} metadata, {} data operations",
            metadata.len(),
            data.len()
        );
        let result = self.fs.writeback().commit(metadata, data);
        if let Err(err) = &result {
            error!(
                "writeback failed, filesystem is now read-only: {}",
                Report::new(err)
            );
            self.fs.set_read_only();
        }
        result
    }
}

/// Checks that every node and block of a chain is allocated and that no
/// block appears twice. Sorts `extents` by start.
fn check_release(
    fs: &Filesystem,
    nodes: &[u32],
    extents: &mut [(u32, Extent)],
) -> Result<(), FsError> {
    let node_allocator = fs.inodes().allocator();
    for &node in nodes {
        ensure!(
            node_allocator.is_allocated(node as usize),
            IoDataIntegritySnafu {
                node,
                reason: "node is free in the inode bitmap",
            }
        );
    }

    let blocks = fs.block_allocator();
    let pool_total = blocks.pool_total() as u64;
    extents.sort_unstable_by_key(|(_, extent)| extent.start());
    let mut covered = 0;
    for &(node, extent) in &*extents {
        ensure!(
            extent.end() <= pool_total,
            IoDataIntegritySnafu {
                node,
                reason: "extent reaches past the block pool",
            }
        );
        ensure!(
            extent.start() >= covered,
            IoDataIntegritySnafu {
                node,
                reason: "extents overlap",
            }
        );
        let range = extent.start() as usize..extent.end() as usize;
        ensure!(
            range.is_empty() || blocks.find(false, range, 1).is_err(),
            IoDataIntegritySnafu {
                node,
                reason: "extent covers a free block",
            }
        );
        covered = extent.end();
    }
    Ok(())
}

impl PendingWork for Transaction<'_> {
    fn enqueue_metadata(&mut self, op: BufferedOperation) {
        self.journal.enqueue_metadata(op);
    }

    fn enqueue_data(&mut self, op: BufferedOperation) {
        self.journal.enqueue_data(op);
    }

    fn record_node(&mut self, ino: u32, previous: &Node) {
        self.journal.record_node(ino, previous);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let committed = [&self.inode_reservation, &self.block_reservation]
            .into_iter()
            .flatten()
            .all(AllocatorReservation::is_committed);
        let queue = &self.journal.queue;
        if !committed || !queue.is_empty() {
            warn!(
                "rolling back transaction with {} metadata and {} data operations",
                queue.metadata().len(),
                queue.data().len()
            );
        }
        let inodes = self.fs.inodes();
        for (ino, node) in mem::take(&mut self.journal.previous) {
            inodes.restore_node(ino, &node);
        }
    }
}
