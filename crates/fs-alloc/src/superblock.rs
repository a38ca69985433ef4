//! Superblock record and its in-memory handle.

use alloc::{format, vec, vec::Vec};

use bitflags::bitflags;
use dataview::{DataView, Pod, PodMethods as _};
use derive_more::IsVariant;
use log::trace;
use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    error::{FsError, InvalidSuperblockSnafu},
    layout::{
        BLOCK_SIZE, FORMAT_VERSION, INODE_SIZE, INODES_PER_BLOCK, MAGIC0, MAGIC1,
        SUPERBLOCK_BACKUP, SUPERBLOCK_START, bitmap_blocks, inode_table_blocks,
    },
    operation::{BufferedOperation, PendingWork},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuperblockFlags: u32 {
        /// The filesystem was unmounted cleanly.
        const CLEAN = 1 << 0;
        /// Regions live at fixed virtual offsets and grow by FVM slices.
        const FVM = 1 << 1;
    }
}

/// On-disk superblock, stored little-endian at blocks 0 and 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    /// FVM slice size in bytes, 0 without FVM.
    pub slice_size: u64,
    pub format_version: u32,
    flags: u32,
    pub block_size: u32,
    pub inode_size: u32,
    /// Data blocks in the block pool.
    pub block_count: u32,
    /// Inodes in the inode pool.
    pub inode_count: u32,
    pub alloc_block_count: u32,
    pub alloc_inode_count: u32,
    pub ibm_block: u32,
    pub abm_block: u32,
    pub ino_block: u32,
    pub dat_block: u32,
    pub ibm_slices: u32,
    pub abm_slices: u32,
    pub ino_slices: u32,
    pub dat_slices: u32,
}

const _: () = assert!(size_of::<Superblock>() == 88);
const _: () = assert!(size_of::<Superblock>() <= BLOCK_SIZE);

impl Superblock {
    #[must_use]
    pub fn flags(&self) -> SuperblockFlags {
        SuperblockFlags::from_bits_retain(self.flags)
    }

    pub fn set_flags(&mut self, flags: SuperblockFlags) {
        self.flags = flags.bits();
    }

    #[must_use]
    pub fn uses_fvm(&self) -> bool {
        self.flags().contains(SuperblockFlags::FVM)
    }

    /// Blocks per FVM slice, 0 without FVM.
    #[must_use]
    pub fn slice_blocks(&self) -> u64 {
        self.slice_size / BLOCK_SIZE as u64
    }

    /// Decodes a superblock from the start of `block`.
    pub fn decode(block: &[u8]) -> Result<Self, FsError> {
        DataView::from(block)
            .try_read::<Self>(0)
            .context(InvalidSuperblockSnafu {
                reason: format!("block of {} bytes is too short", block.len()),
            })
    }

    /// Encodes the superblock into a zero-padded block.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0; BLOCK_SIZE];
        block[..size_of::<Self>()].copy_from_slice(self.as_bytes());
        block
    }

    /// Checks the fields that the allocators rely on.
    pub fn validate(&self) -> Result<(), FsError> {
        let fail = |reason| InvalidSuperblockSnafu { reason };
        ensure!(
            self.magic0 == MAGIC0 && self.magic1 == MAGIC1,
            fail(format!("bad magic {:#x}/{:#x}", self.magic0, self.magic1))
        );
        ensure!(
            self.format_version == FORMAT_VERSION,
            fail(format!("unsupported version {}", self.format_version))
        );
        ensure!(
            self.block_size as usize == BLOCK_SIZE && self.inode_size as usize == INODE_SIZE,
            fail(format!(
                "unsupported geometry: block {} inode {}",
                self.block_size, self.inode_size
            ))
        );
        ensure!(
            self.alloc_block_count <= self.block_count
                && self.alloc_inode_count <= self.inode_count,
            fail(format!(
                "allocated counts exceed pools: {}/{} blocks, {}/{} inodes",
                self.alloc_block_count, self.block_count, self.alloc_inode_count, self.inode_count
            ))
        );

        let inode_count = self.inode_count as usize;
        let block_count = self.block_count as usize;
        if self.uses_fvm() {
            let slice_blocks = self.slice_blocks();
            ensure!(
                slice_blocks > 0 && self.slice_size % BLOCK_SIZE as u64 == 0,
                fail(format!("bad slice size {}", self.slice_size))
            );
            let cover = |slices: u32| u64::from(slices) * slice_blocks;
            ensure!(
                bitmap_blocks(inode_count) as u64 <= cover(self.ibm_slices)
                    && bitmap_blocks(block_count) as u64 <= cover(self.abm_slices)
                    && inode_table_blocks(inode_count) as u64 <= cover(self.ino_slices)
                    && block_count as u64 <= cover(self.dat_slices),
                fail(format!(
                    "slices {}/{}/{}/{} cannot hold {inode_count} inodes and {block_count} blocks",
                    self.ibm_slices, self.abm_slices, self.ino_slices, self.dat_slices
                ))
            );
        } else {
            ensure!(
                u64::from(self.ibm_block) + bitmap_blocks(inode_count) as u64
                    <= u64::from(self.abm_block)
                    && u64::from(self.abm_block) + bitmap_blocks(block_count) as u64
                        <= u64::from(self.ino_block)
                    && u64::from(self.ino_block) + inode_table_blocks(inode_count) as u64
                        <= u64::from(self.dat_block),
                fail("regions overlap".into())
            );
        }
        ensure!(
            inode_count % INODES_PER_BLOCK == 0,
            fail(format!("inode count {inode_count} is not a whole number of blocks"))
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum UpdateBackup {
    Yes,
    No,
}

/// Shared, lock-protected copy of the mounted superblock.
#[derive(Debug)]
pub struct SuperblockManager {
    info: Mutex<Superblock>,
}

impl SuperblockManager {
    #[must_use]
    pub fn new(info: Superblock) -> Self {
        Self {
            info: Mutex::new(info),
        }
    }

    #[must_use]
    pub fn info(&self) -> Superblock {
        *self.info.lock()
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        f(&mut self.info.lock())
    }

    /// Enqueues the current superblock, and its backup copy if requested.
    pub fn write(&self, work: &mut dyn PendingWork, update_backup: UpdateBackup) {
        let block = self.info().encode();
        trace!("writing superblock (backup: {update_backup:?})");
        if update_backup.is_yes() {
            work.enqueue_metadata(BufferedOperation::write(SUPERBLOCK_BACKUP, block.clone()));
        }
        work.enqueue_metadata(BufferedOperation::write(SUPERBLOCK_START, block));
    }
}
