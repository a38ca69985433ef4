//! On-disk geometry.
//!
//! Non-FVM images are laid out back to back:
//!
//! ```text
//! | superblock | backup | inode bitmap | block bitmap | inode table | data ... |
//! ```
//!
//! FVM images place each region at a fixed virtual block so that every
//! region can grow by whole slices without moving the others.

pub const BLOCK_SIZE: usize = 8192;
/// Number of bits described by one bitmap block.
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;

pub const INODE_SIZE: usize = 256;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
const _: () = assert!(BLOCK_SIZE % INODE_SIZE == 0);

pub const MAGIC0: u64 = 0x002f_5ca1_ab1e_0001;
pub const MAGIC1: u64 = 0x0000_b10c_a110_c8ed;
pub const FORMAT_VERSION: u32 = 1;

pub const SUPERBLOCK_START: u64 = 0;
pub const SUPERBLOCK_BACKUP: u64 = 1;
pub const NON_FVM_METADATA_START: u64 = 2;

pub const FVM_BLOCK_INODE_BM_START: u64 = 0x1_0000;
pub const FVM_BLOCK_DATA_BM_START: u64 = 0x2_0000;
pub const FVM_BLOCK_INODE_START: u64 = 0x3_0000;
pub const FVM_BLOCK_DATA_START: u64 = 0x5_0000;

/// Number of bitmap blocks needed to describe `elements` elements.
#[must_use]
pub const fn bitmap_blocks(elements: usize) -> usize {
    elements.div_ceil(BLOCK_BITS)
}

/// Number of inode table blocks needed to hold `inodes` records.
#[must_use]
pub const fn inode_table_blocks(inodes: usize) -> usize {
    inodes.div_ceil(INODES_PER_BLOCK)
}

/// Returns the table block (relative to the table start) and the byte
/// offset inside that block where inode `ino` is stored.
#[must_use]
pub const fn inode_position(ino: u32) -> (usize, usize) {
    let ino = ino as usize;
    (ino / INODES_PER_BLOCK, (ino % INODES_PER_BLOCK) * INODE_SIZE)
}
