//! Node map records.
//!
//! Every slot of the inode table holds a 256-byte node. A node is either an
//! [`Inode`], which carries the first few extents of a file inline, or an
//! [`ExtentContainer`] holding further extents. Nodes of one file are
//! linked through `next_node`; containers also point back through
//! `previous_node`.

use core::fmt;

use bitflags::bitflags;
use dataview::{DataView, Pod, PodMethods as _};

use crate::{error::FsError, layout::INODE_SIZE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        const ALLOCATED = 1 << 0;
        const EXTENT_CONTAINER = 1 << 1;
    }
}

pub const INLINE_MAX_EXTENTS: usize = 4;
pub const CONTAINER_MAX_EXTENTS: usize = 30;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct NodePrelude {
    flags: u16,
    pub version: u16,
    /// Next node of the chain, meaningful only while extents remain.
    pub next_node: u32,
}

impl NodePrelude {
    #[must_use]
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            flags: flags.bits(),
            version: 0,
            next_node: 0,
        }
    }

    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_retain(self.flags)
    }

    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags = flags.bits();
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.flags().contains(NodeFlags::ALLOCATED)
    }

    #[must_use]
    pub fn is_extent_container(&self) -> bool {
        self.flags().contains(NodeFlags::EXTENT_CONTAINER)
    }
}

/// A run of data blocks: 48-bit block-pool start, 16-bit length.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Pod)]
pub struct Extent(u64);

impl Extent {
    pub const MAX_START: u64 = (1 << 48) - 1;
    pub const MAX_LENGTH: u16 = u16::MAX;

    /// # Panics
    ///
    /// Panics if `start` does not fit in 48 bits.
    #[must_use]
    pub fn new(start: u64, length: u16) -> Self {
        assert!(start <= Self::MAX_START, "extent start {start} too large");
        Self(start | (u64::from(length) << 48))
    }

    #[must_use]
    pub fn start(self) -> u64 {
        self.0 & Self::MAX_START
    }

    #[must_use]
    pub fn length(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[must_use]
    pub fn end(self) -> u64 {
        self.start() + u64::from(self.length())
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({}..{})", self.start(), self.end())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct Inode {
    pub prelude: NodePrelude,
    pub size: u64,
    pub block_count: u32,
    /// Extents of the whole chain, inline ones included.
    pub extent_count: u16,
    pub mode: u16,
    pub link_count: u32,
    pub generation: u32,
    pub create_time: u64,
    pub modify_time: u64,
    pub inline_extents: [Extent; INLINE_MAX_EXTENTS],
    reserved: [u32; 44],
}

const _: () = assert!(size_of::<Inode>() == INODE_SIZE);

impl Inode {
    /// A fresh allocated inode with no extents.
    #[must_use]
    pub fn new() -> Self {
        let mut inode = Self::zeroed();
        inode.prelude = NodePrelude::new(NodeFlags::ALLOCATED);
        inode.link_count = 1;
        inode
    }

    #[must_use]
    pub fn inline_extents(&self) -> &[Extent] {
        let count = usize::min(usize::from(self.extent_count), INLINE_MAX_EXTENTS);
        &self.inline_extents[..count]
    }
}

impl Default for Inode {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct ExtentContainer {
    pub prelude: NodePrelude,
    pub previous_node: u32,
    pub extent_count: u16,
    reserved: u16,
    pub extents: [Extent; CONTAINER_MAX_EXTENTS],
}

const _: () = assert!(size_of::<ExtentContainer>() == INODE_SIZE);

impl ExtentContainer {
    /// # Panics
    ///
    /// Panics if `extents` does not fit in one container.
    #[must_use]
    pub fn new(previous_node: u32, extents: &[Extent]) -> Self {
        assert!(extents.len() <= CONTAINER_MAX_EXTENTS);
        let mut container = Self::zeroed();
        container.prelude = NodePrelude::new(NodeFlags::ALLOCATED | NodeFlags::EXTENT_CONTAINER);
        container.previous_node = previous_node;
        container.extent_count = extents.len() as u16;
        container.extents[..extents.len()].copy_from_slice(extents);
        container
    }

    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        let count = usize::min(usize::from(self.extent_count), CONTAINER_MAX_EXTENTS);
        &self.extents[..count]
    }
}

/// A decoded node-map slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Inode(Inode),
    Container(ExtentContainer),
}

impl Node {
    /// Decodes the node stored in `bytes`, which must hold one record.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        let view = DataView::from(&bytes[..INODE_SIZE]);
        let prelude = view.read::<NodePrelude>(0);
        if prelude.is_extent_container() {
            Self::Container(view.read(0))
        } else {
            Self::Inode(view.read(0))
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        let bytes = match self {
            Self::Inode(inode) => inode.as_bytes(),
            Self::Container(container) => container.as_bytes(),
        };
        out[..INODE_SIZE].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn prelude(&self) -> &NodePrelude {
        match self {
            Self::Inode(inode) => &inode.prelude,
            Self::Container(container) => &container.prelude,
        }
    }

    pub fn prelude_mut(&mut self) -> &mut NodePrelude {
        match self {
            Self::Inode(inode) => &mut inode.prelude,
            Self::Container(container) => &mut container.prelude,
        }
    }

    /// An unallocated, zeroed slot.
    #[must_use]
    pub fn free() -> Self {
        Self::Inode(Inode::zeroed())
    }
}

/// Looks up nodes by index.
pub trait NodeFinder {
    /// Returns the node at `index`, or `InvalidArgument` if the index is
    /// outside the table.
    fn get_node(&self, index: u32) -> Result<Node, FsError>;
}
