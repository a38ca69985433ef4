//! Block and inode allocation with transactional write-back for an
//! extent-based filesystem.
//!
//! A formatted device is split into four regions: the inode bitmap, the
//! block bitmap, the inode table and the data blocks. On a volume-managed
//! device each region starts at a fixed virtual block and grows by whole
//! slices when its pool runs out.
//!
//! # Components
//!
//! - [`Allocator`] tracks one element pool (blocks or inodes) in a
//!   run-length encoded bitmap. Elements are claimed up front through an
//!   [`AllocatorReservation`] so a transaction can never run out of space
//!   halfway through.
//! - [`AllocatorStorage`] persists allocator changes as queued bitmap and
//!   superblock writes and knows how to grow a pool.
//! - [`InodeManager`] owns the inode table and the inode allocator.
//! - [`AllocatedExtentIterator`] and [`BlockIterator`] walk a file's extent
//!   chain; [`NodePopulator`] writes one.
//! - [`Transaction`] collects reservations and block operations and hands
//!   them to a [`Writeback`] on commit.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use fs_alloc::{
//!     DirectWriteback, Extent, FormatOptions, Filesystem, Inode, MountOptions, RamDevice,
//!     format,
//! };
//!
//! let device = Arc::new(RamDevice::new(512));
//! format(device.as_ref(), &FormatOptions::default())?;
//! let writeback = Box::new(DirectWriteback::new(device.clone()));
//! let fs = Filesystem::open(device, writeback, MountOptions::default())?;
//!
//! let mut transaction = fs.begin_transaction(1, 2)?;
//! let ino = transaction.create_inode(&Inode::new())?;
//! let first = transaction.allocate_block();
//! let second = transaction.allocate_block();
//! assert_eq!(second, first + 1);
//! transaction.populate_inode(ino, &[Extent::new(first as u64, 2)])?;
//! transaction.commit()?;
//!
//! assert!(fs.block_allocator().is_allocated(first));
//! # Ok::<(), fs_alloc::FsError>(())
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    allocator::{Allocator, AllocatorLoader, AllocatorReservation},
    buffer::{BlockBuffer, SharedBuffer},
    device::{BlockDevice, DeviceError, RamDevice, VolumeInfo},
    error::{ErrorKind, FsError},
    extent::{
        AllocatedExtentIterator, BlockIterator, BlockRun, NodePopulator, containers_needed,
        stream_blocks,
    },
    fs::{Filesystem, FormatOptions, MountOptions, format},
    inode_manager::{InodeManager, InodeManagerLoader},
    node::{
        CONTAINER_MAX_EXTENTS, Extent, ExtentContainer, INLINE_MAX_EXTENTS, Inode, Node,
        NodeFinder, NodeFlags, NodePrelude,
    },
    operation::{
        BufferedOperation, Operation, OperationKind, OperationQueue, PendingWork, ReadBatch,
    },
    storage::{
        AllocatorMetadata, AllocatorStorage, FvmMetadata, GrowMap, InMemoryStorage,
        PersistentStorage, PoolKind,
    },
    superblock::{Superblock, SuperblockFlags, SuperblockManager, UpdateBackup},
    transaction::Transaction,
    writeback::{DirectWriteback, Writeback},
};

mod allocator;
mod buffer;
mod device;
mod error;
mod extent;
mod fs;
mod inode_manager;
pub mod layout;
mod node;
mod operation;
mod storage;
mod superblock;
mod transaction;
mod writeback;
