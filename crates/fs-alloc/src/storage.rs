//! Where an allocator's bitmap lives and how it grows.

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};

use derive_more::Display;
use log::{debug, trace};
use rle_bitmap::RleBitmap;
use snafu::{ResultExt as _, ensure};

use crate::{
    buffer::SharedBuffer,
    device::BlockDevice,
    error::{BitmapSnafu, CannotExtendSnafu, DeviceSnafu, FsError},
    layout::{BLOCK_BITS, BLOCK_SIZE, INODES_PER_BLOCK, bitmap_blocks},
    operation::{BufferedOperation, PendingWork, ReadBatch},
    superblock::{Superblock, SuperblockManager, UpdateBackup},
};

/// The two element pools of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PoolKind {
    #[display("block")]
    Blocks,
    #[display("inode")]
    Inodes,
}

impl PoolKind {
    /// Elements stored in one block of the pool's data region.
    #[must_use]
    pub fn elements_per_block(self) -> usize {
        match self {
            Self::Blocks => 1,
            Self::Inodes => INODES_PER_BLOCK,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FvmMetadata {
    /// Slices backing the pool's data region.
    pub data_slices: u32,
    /// Slices backing the pool's bitmap.
    pub metadata_slices: u32,
    /// Slice size in bytes.
    pub slice_size: u64,
}

impl FvmMetadata {
    #[must_use]
    pub fn blocks_per_slice(&self) -> u64 {
        self.slice_size / BLOCK_SIZE as u64
    }
}

/// Layout descriptors and counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorMetadata {
    pub data_start_block: u64,
    pub metadata_start_block: u64,
    pub using_fvm: bool,
    pub fvm: FvmMetadata,
    /// Elements persistently allocated.
    pub pool_used: usize,
    pub pool_total: usize,
}

impl AllocatorMetadata {
    fn of(info: &Superblock, kind: PoolKind) -> Self {
        let fvm = |data_slices, metadata_slices| FvmMetadata {
            data_slices,
            metadata_slices,
            slice_size: info.slice_size,
        };
        match kind {
            PoolKind::Blocks => Self {
                data_start_block: u64::from(info.dat_block),
                metadata_start_block: u64::from(info.abm_block),
                using_fvm: info.uses_fvm(),
                fvm: fvm(info.dat_slices, info.abm_slices),
                pool_used: info.alloc_block_count as usize,
                pool_total: info.block_count as usize,
            },
            PoolKind::Inodes => Self {
                data_start_block: u64::from(info.ino_block),
                metadata_start_block: u64::from(info.ibm_block),
                using_fvm: info.uses_fvm(),
                fvm: fvm(info.ino_slices, info.ibm_slices),
                pool_used: info.alloc_inode_count as usize,
                pool_total: info.inode_count as usize,
            },
        }
    }
}

/// In-memory map that grows together with its storage.
pub trait GrowMap {
    /// Grows the map to `pool_total` elements and returns the previous size.
    fn grow_to(&mut self, pool_total: usize) -> Result<usize, FsError>;

    fn map(&self) -> &RleBitmap;
}

impl GrowMap for RleBitmap {
    fn grow_to(&mut self, pool_total: usize) -> Result<usize, FsError> {
        let previous = self.capacity();
        self.grow(pool_total).context(BitmapSnafu)?;
        Ok(previous)
    }

    fn map(&self) -> &RleBitmap {
        self
    }
}

/// Persistence backend of an [`Allocator`](crate::Allocator).
///
/// All writes are enqueued as metadata into the transaction passed in; none
/// is issued directly.
pub trait AllocatorStorage: Send {
    fn kind(&self) -> PoolKind;

    /// Schedules the read of the on-disk bitmap into `buffer`.
    fn load(&self, batch: &mut ReadBatch, buffer: &SharedBuffer);

    /// Adds one allocation unit to the pool and grows `map` to match.
    fn extend(&mut self, work: &mut dyn PendingWork, map: &mut dyn GrowMap)
    -> Result<(), FsError>;

    /// Enqueues the bitmap blocks covering `[index, index + count)`.
    fn persist_range(
        &self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    );

    /// Records `count` newly allocated elements starting at `index`.
    fn persist_allocate(
        &mut self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    );

    /// Records `count` released elements starting at `index`.
    fn persist_release(
        &mut self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    );

    /// Elements not persistently allocated.
    fn pool_available(&self) -> usize {
        let metadata = self.metadata();
        metadata.pool_total - metadata.pool_used
    }

    fn pool_total(&self) -> usize {
        self.metadata().pool_total
    }

    fn metadata(&self) -> AllocatorMetadata;
}

/// Storage backed by the superblock and bitmap regions of a device.
pub struct PersistentStorage {
    device: Arc<dyn BlockDevice>,
    superblock: Arc<SuperblockManager>,
    kind: PoolKind,
    allow_growth: bool,
}

impl PersistentStorage {
    #[must_use]
    pub fn new(
        device: Arc<dyn BlockDevice>,
        superblock: Arc<SuperblockManager>,
        kind: PoolKind,
        allow_growth: bool,
    ) -> Self {
        Self {
            device,
            superblock,
            kind,
            allow_growth,
        }
    }

    fn adjust_used(&self, count: usize, grow: bool) {
        let kind = self.kind;
        self.superblock.mutate(|info| {
            let used = match kind {
                PoolKind::Blocks => &mut info.alloc_block_count,
                PoolKind::Inodes => &mut info.alloc_inode_count,
            };
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            *used = if grow {
                used.checked_add(count)
            } else {
                used.checked_sub(count)
            }
            .unwrap_or_else(|| panic!("{kind} usage counter out of range"));
        });
    }
}

impl AllocatorStorage for PersistentStorage {
    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn load(&self, batch: &mut ReadBatch, buffer: &SharedBuffer) {
        let metadata = self.metadata();
        let blocks = bitmap_blocks(metadata.pool_total);
        buffer.lock().grow(blocks);
        batch.add(metadata.metadata_start_block, blocks, buffer, 0);
    }

    fn extend(
        &mut self,
        work: &mut dyn PendingWork,
        map: &mut dyn GrowMap,
    ) -> Result<(), FsError> {
        let pool = self.kind;
        let metadata = self.metadata();
        ensure!(
            metadata.using_fvm,
            CannotExtendSnafu {
                pool,
                reason: "volume is not managed by FVM",
            }
        );
        ensure!(
            self.allow_growth,
            CannotExtendSnafu {
                pool,
                reason: "growth disabled by mount options",
            }
        );

        let slice_blocks = metadata.fvm.blocks_per_slice();
        let elements_per_slice = slice_blocks as usize * pool.elements_per_block();
        let data_slices = metadata.fvm.data_slices + 1;
        let pool_total = data_slices as usize * elements_per_slice;
        let bitmap_capacity =
            metadata.fvm.metadata_slices as usize * slice_blocks as usize * BLOCK_BITS;
        ensure!(
            pool_total <= bitmap_capacity && u32::try_from(pool_total).is_ok(),
            CannotExtendSnafu {
                pool,
                reason: "bitmap region cannot describe the grown pool",
            }
        );

        let slice_offset = metadata.data_start_block / slice_blocks + u64::from(data_slices - 1);
        self.device.extend(slice_offset, 1).context(DeviceSnafu)?;
        // If growing the map fails the new slice stays mapped but unused;
        // the next extend asks for the same slice offset and reuses it.
        let previous = map.grow_to(pool_total)?;
        debug!("{pool} pool grown from {previous} to {pool_total} (slice {slice_offset})");

        self.superblock.mutate(|info| match pool {
            PoolKind::Blocks => {
                info.block_count = pool_total as u32;
                info.dat_slices = data_slices;
            }
            PoolKind::Inodes => {
                info.inode_count = pool_total as u32;
                info.ino_slices = data_slices;
            }
        });

        if pool == PoolKind::Inodes {
            // Fresh inode table blocks must read as unallocated nodes.
            let first = metadata.data_start_block + u64::from(data_slices - 1) * slice_blocks;
            work.enqueue_metadata(BufferedOperation::write(
                first,
                vec![0; slice_blocks as usize * BLOCK_SIZE],
            ));
        }
        self.persist_range(work, map.map(), previous, pool_total - previous);
        self.superblock.write(work, UpdateBackup::Yes);
        Ok(())
    }

    fn persist_range(
        &self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    ) {
        if count == 0 {
            return;
        }
        let first_block = index / BLOCK_BITS;
        let last_block = (index + count - 1) / BLOCK_BITS;
        let block_count = last_block - first_block + 1;
        let mut bytes = vec![0; block_count * BLOCK_SIZE];
        map.write_raw(first_block * BLOCK_BITS, &mut bytes);
        let dev_block = self.metadata().metadata_start_block + first_block as u64;
        trace!(
            "{} bitmap blocks {dev_block}+{block_count} for elements {index}+{count}",
            self.kind
        );
        work.enqueue_metadata(BufferedOperation::write(dev_block, bytes));
    }

    fn persist_allocate(
        &mut self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    ) {
        self.adjust_used(count, true);
        self.persist_range(work, map, index, count);
        self.superblock.write(work, UpdateBackup::No);
    }

    fn persist_release(
        &mut self,
        work: &mut dyn PendingWork,
        map: &RleBitmap,
        index: usize,
        count: usize,
    ) {
        self.adjust_used(count, false);
        self.persist_range(work, map, index, count);
        self.superblock.write(work, UpdateBackup::No);
    }

    fn metadata(&self) -> AllocatorMetadata {
        AllocatorMetadata::of(&self.superblock.info(), self.kind)
    }
}

/// Storage for host tooling and tests: nothing is read or written, only the
/// usage counter is kept.
#[derive(Debug)]
pub struct InMemoryStorage {
    kind: PoolKind,
    pool_total: usize,
    pool_used: usize,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new(kind: PoolKind, pool_total: usize) -> Self {
        Self {
            kind,
            pool_total,
            pool_used: 0,
        }
    }

    #[must_use]
    pub fn boxed(kind: PoolKind, pool_total: usize) -> Box<dyn AllocatorStorage> {
        Box::new(Self::new(kind, pool_total))
    }
}

impl AllocatorStorage for InMemoryStorage {
    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn load(&self, _batch: &mut ReadBatch, _buffer: &SharedBuffer) {}

    fn extend(
        &mut self,
        _work: &mut dyn PendingWork,
        _map: &mut dyn GrowMap,
    ) -> Result<(), FsError> {
        CannotExtendSnafu {
            pool: self.kind,
            reason: "in-memory storage has a fixed size",
        }
        .fail()
    }

    fn persist_range(
        &self,
        _work: &mut dyn PendingWork,
        _map: &RleBitmap,
        _index: usize,
        _count: usize,
    ) {
    }

    fn persist_allocate(
        &mut self,
        _work: &mut dyn PendingWork,
        _map: &RleBitmap,
        _index: usize,
        count: usize,
    ) {
        self.pool_used += count;
    }

    fn persist_release(
        &mut self,
        _work: &mut dyn PendingWork,
        _map: &RleBitmap,
        _index: usize,
        count: usize,
    ) {
        self.pool_used = self
            .pool_used
            .checked_sub(count)
            .unwrap_or_else(|| panic!("{} usage counter out of range", self.kind));
    }

    fn metadata(&self) -> AllocatorMetadata {
        AllocatorMetadata {
            pool_used: self.pool_used,
            pool_total: self.pool_total,
            ..AllocatorMetadata::default()
        }
    }
}
