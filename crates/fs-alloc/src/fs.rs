//! Filesystem context: formatting, mounting and the shared state that
//! transactions work against.

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use dataview::PodMethods as _;
use log::{debug, info};
use snafu::{ResultExt as _, ensure};
use spin::Mutex;

use crate::{
    allocator::Allocator,
    device::{BlockDevice, VolumeInfo},
    error::{DeviceSnafu, FsError, InvalidArgumentSnafu},
    inode_manager::InodeManager,
    layout::{
        BLOCK_SIZE, FORMAT_VERSION, FVM_BLOCK_DATA_BM_START, FVM_BLOCK_DATA_START,
        FVM_BLOCK_INODE_BM_START, FVM_BLOCK_INODE_START, INODE_SIZE, INODES_PER_BLOCK, MAGIC0,
        MAGIC1, NON_FVM_METADATA_START, SUPERBLOCK_BACKUP, SUPERBLOCK_START, bitmap_blocks,
        inode_table_blocks,
    },
    operation::ReadBatch,
    storage::{PersistentStorage, PoolKind},
    superblock::{Superblock, SuperblockFlags, SuperblockManager},
    transaction::Transaction,
    writeback::Writeback,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// Inodes to create on a plain device, rounded up to whole table
    /// blocks. FVM images start with one slice of inodes instead.
    pub inode_count: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self { inode_count: 4096 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    /// Allow pools to grow by FVM slices when they run out.
    pub allow_growth: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_growth: true,
        }
    }
}

fn blank_superblock() -> Superblock {
    let mut info = Superblock::zeroed();
    info.magic0 = MAGIC0;
    info.magic1 = MAGIC1;
    info.format_version = FORMAT_VERSION;
    info.block_size = BLOCK_SIZE as u32;
    info.inode_size = INODE_SIZE as u32;
    info
}

fn plain_layout(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock, FsError> {
    let inode_count = (options.inode_count as usize)
        .max(1)
        .next_multiple_of(INODES_PER_BLOCK);
    let total = device.block_count();
    let ibm = NON_FVM_METADATA_START;
    let abm = ibm + bitmap_blocks(inode_count) as u64;
    let abm_blocks = bitmap_blocks(usize::try_from(total).unwrap_or(usize::MAX)) as u64;
    let ino = abm + abm_blocks;
    let dat = ino + inode_table_blocks(inode_count) as u64;
    ensure!(
        dat < total,
        InvalidArgumentSnafu {
            what: "device size in blocks",
            value: total,
            limit: dat + 1,
        }
    );
    let block_count = u32::try_from(total - dat).unwrap_or(u32::MAX);

    let mut info = blank_superblock();
    info.set_flags(SuperblockFlags::CLEAN);
    info.inode_count = inode_count as u32;
    info.block_count = block_count;
    info.ibm_block = ibm as u32;
    info.abm_block = abm as u32;
    info.ino_block = ino as u32;
    info.dat_block = dat as u32;
    Ok(info)
}

fn fvm_layout(device: &dyn BlockDevice, volume: VolumeInfo) -> Result<Superblock, FsError> {
    let slice_blocks = volume.slice_size / BLOCK_SIZE as u64;
    ensure!(
        slice_blocks > 0
            && volume.slice_size % BLOCK_SIZE as u64 == 0
            && FVM_BLOCK_INODE_BM_START % slice_blocks == 0,
        InvalidArgumentSnafu {
            what: "slice size",
            value: volume.slice_size,
            limit: FVM_BLOCK_INODE_BM_START * BLOCK_SIZE as u64,
        }
    );
    for start in [
        FVM_BLOCK_INODE_BM_START,
        FVM_BLOCK_DATA_BM_START,
        FVM_BLOCK_INODE_START,
        FVM_BLOCK_DATA_START,
    ] {
        device.extend(start / slice_blocks, 1).context(DeviceSnafu)?;
    }

    let mut info = blank_superblock();
    info.set_flags(SuperblockFlags::CLEAN | SuperblockFlags::FVM);
    info.slice_size = volume.slice_size;
    info.inode_count = (slice_blocks as usize * INODES_PER_BLOCK) as u32;
    info.block_count = slice_blocks as u32;
    info.ibm_block = FVM_BLOCK_INODE_BM_START as u32;
    info.abm_block = FVM_BLOCK_DATA_BM_START as u32;
    info.ino_block = FVM_BLOCK_INODE_START as u32;
    info.dat_block = FVM_BLOCK_DATA_START as u32;
    info.ibm_slices = 1;
    info.abm_slices = 1;
    info.ino_slices = 1;
    info.dat_slices = 1;
    Ok(info)
}

/// Writes an empty filesystem to `device` and returns its superblock.
///
/// Element 0 of both pools is marked allocated so that index 0 can mean
/// "none" in on-disk links.
pub fn format(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock, FsError> {
    ensure!(
        device.block_size() == BLOCK_SIZE,
        InvalidArgumentSnafu {
            what: "device block size",
            value: device.block_size() as u64,
            limit: BLOCK_SIZE as u64,
        }
    );
    let mut info = match device.volume_info() {
        Some(volume) => fvm_layout(device, volume)?,
        None => plain_layout(device, options)?,
    };
    info.alloc_block_count = 1;
    info.alloc_inode_count = 1;
    info.validate()?;

    let write = |block: u64, data: &[u8]| device.write_blocks(block, data).context(DeviceSnafu);
    let bitmap = |elements: usize| {
        let mut bytes = vec![0; bitmap_blocks(elements) * BLOCK_SIZE];
        bytes[0] = 0x01;
        bytes
    };
    write(u64::from(info.ibm_block), &bitmap(info.inode_count as usize))?;
    write(u64::from(info.abm_block), &bitmap(info.block_count as usize))?;
    let table_blocks = inode_table_blocks(info.inode_count as usize);
    write(u64::from(info.ino_block), &vec![0; table_blocks * BLOCK_SIZE])?;
    let encoded = info.encode();
    write(SUPERBLOCK_BACKUP, &encoded)?;
    write(SUPERBLOCK_START, &encoded)?;
    device.flush().context(DeviceSnafu)?;
    info!(
        "formatted {} blocks and {} inodes{}",
        info.block_count,
        info.inode_count,
        if info.uses_fvm() { " on FVM" } else { "" }
    );
    Ok(info)
}

/// A mounted filesystem.
pub struct Filesystem {
    device: Arc<dyn BlockDevice>,
    superblock: Arc<SuperblockManager>,
    block_allocator: Allocator,
    inodes: InodeManager,
    writeback: Box<dyn Writeback>,
    writer_lock: Mutex<()>,
    read_only: AtomicBool,
}

impl Filesystem {
    /// Reads the superblock and loads both allocators and the inode table
    /// through one read batch.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        writeback: Box<dyn Writeback>,
        options: MountOptions,
    ) -> Result<Self, FsError> {
        ensure!(
            device.block_size() == BLOCK_SIZE,
            InvalidArgumentSnafu {
                what: "device block size",
                value: device.block_size() as u64,
                limit: BLOCK_SIZE as u64,
            }
        );
        let mut block = vec![0; BLOCK_SIZE];
        device
            .read_blocks(SUPERBLOCK_START, &mut block)
            .context(DeviceSnafu)?;
        let info = Superblock::decode(&block)?;
        info.validate()?;
        let superblock = Arc::new(SuperblockManager::new(info));

        let storage = |kind| {
            Box::new(PersistentStorage::new(
                Arc::clone(&device),
                Arc::clone(&superblock),
                kind,
                options.allow_growth,
            ))
        };
        let mut batch = ReadBatch::new();
        let blocks = Allocator::create(&mut batch, storage(PoolKind::Blocks));
        let inodes = InodeManager::create(
            &mut batch,
            storage(PoolKind::Inodes),
            u64::from(info.ino_block),
        );
        batch.run(device.as_ref()).context(DeviceSnafu)?;

        let fs = Self {
            device,
            superblock,
            block_allocator: blocks.finish(),
            inodes: inodes.finish(),
            writeback,
            writer_lock: Mutex::new(()),
            read_only: AtomicBool::new(options.read_only),
        };
        debug!(
            "mounted: {}/{} blocks, {}/{} inodes free{}",
            fs.block_allocator.pool_available(),
            info.block_count,
            fs.inodes.allocator().pool_available(),
            info.inode_count,
            if options.read_only { ", read-only" } else { "" }
        );
        Ok(fs)
    }

    /// Shorthand for [`Transaction::create`].
    pub fn begin_transaction(
        &self,
        reserve_inodes: usize,
        reserve_blocks: usize,
    ) -> Result<Transaction<'_>, FsError> {
        Transaction::create(self, reserve_inodes, reserve_blocks)
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Snapshot of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.superblock.info()
    }

    #[must_use]
    pub fn superblock_manager(&self) -> &Arc<SuperblockManager> {
        &self.superblock
    }

    #[must_use]
    pub fn block_allocator(&self) -> &Allocator {
        &self.block_allocator
    }

    #[must_use]
    pub fn inodes(&self) -> &InodeManager {
        &self.inodes
    }

    /// Device block holding block-pool element `index`.
    #[must_use]
    pub fn data_block(&self, index: usize) -> u64 {
        u64::from(self.superblock.info().dat_block) + index as u64
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    pub(crate) fn writer_lock(&self) -> &Mutex<()> {
        &self.writer_lock
    }

    pub(crate) fn writeback(&self) -> &dyn Writeback {
        self.writeback.as_ref()
    }

    /// Allocated block-pool runs, for consistency checks.
    #[must_use]
    pub fn allocated_blocks(&self) -> Vec<core::ops::Range<usize>> {
        self.block_allocator.runs()
    }
}
