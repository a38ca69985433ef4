use alloc::vec::Vec;

use log::debug;
use snafu::ensure;

use crate::{
    allocator::AllocatorReservation,
    error::{FsError, InvalidArgumentSnafu},
    inode_manager::InodeManager,
    node::{CONTAINER_MAX_EXTENTS, Extent, ExtentContainer, INLINE_MAX_EXTENTS, Node},
    operation::PendingWork,
};

/// Extent containers needed to hold `extent_count` extents.
#[must_use]
pub fn containers_needed(extent_count: usize) -> usize {
    extent_count
        .saturating_sub(INLINE_MAX_EXTENTS)
        .div_ceil(CONTAINER_MAX_EXTENTS)
}

/// Writes an extent list into an inode and as many containers as needed.
#[derive(Debug, Clone, Copy)]
pub struct NodePopulator<'a> {
    manager: &'a InodeManager,
}

impl<'a> NodePopulator<'a> {
    #[must_use]
    pub fn new(manager: &'a InodeManager) -> Self {
        Self { manager }
    }

    /// Replaces the extents of inode `ino` with `extents`.
    ///
    /// Container nodes are taken from `reservation`, which must hold at
    /// least [`containers_needed`] inodes. Returns the container indices in
    /// chain order.
    ///
    /// # Panics
    ///
    /// Panics if the reservation is too small or belongs to another pool,
    /// or if `ino` is not allocated.
    pub fn populate(
        &self,
        work: &mut dyn PendingWork,
        reservation: &mut AllocatorReservation<'_>,
        ino: u32,
        extents: &[Extent],
    ) -> Result<Vec<u32>, FsError> {
        assert!(
            core::ptr::eq(reservation.allocator(), self.manager.allocator()),
            "container nodes must come from the inode pool"
        );
        let needed = containers_needed(extents.len());
        assert!(
            reservation.reserved() >= needed,
            "{needed} extent containers needed, {} reserved",
            reservation.reserved()
        );
        let extent_count = u16::try_from(extents.len()).ok();
        let block_count = extents
            .iter()
            .map(|extent| u64::from(extent.length()))
            .sum::<u64>();
        let block_count = u32::try_from(block_count).ok();
        let (Some(extent_count), Some(block_count)) = (extent_count, block_count) else {
            return InvalidArgumentSnafu {
                what: "extent list length",
                value: extents.len() as u64,
                limit: u64::from(u16::MAX),
            }
            .fail();
        };

        let mut inode = self.manager.load(ino)?;
        assert!(inode.prelude.is_allocated(), "populating free inode {ino}");
        ensure!(
            inode.extent_count == 0,
            InvalidArgumentSnafu {
                what: "existing extent count",
                value: u64::from(inode.extent_count),
                limit: 0_u64,
            }
        );

        let inline = usize::min(extents.len(), INLINE_MAX_EXTENTS);
        inode.inline_extents = [Extent::default(); INLINE_MAX_EXTENTS];
        inode.inline_extents[..inline].copy_from_slice(&extents[..inline]);
        inode.extent_count = extent_count;
        inode.block_count = block_count;

        let mut containers: Vec<(u32, ExtentContainer)> = Vec::with_capacity(needed);
        let mut previous = ino;
        for chunk in extents[inline..].chunks(CONTAINER_MAX_EXTENTS) {
            let index = reservation.allocate() as u32;
            containers.push((index, ExtentContainer::new(previous, chunk)));
            previous = index;
        }
        inode.prelude.next_node = containers.first().map_or(0, |(index, _)| *index);
        for i in 1..containers.len() {
            let next = containers[i].0;
            containers[i - 1].1.prelude.next_node = next;
        }

        self.manager.update(work, ino, &inode)?;
        for (index, container) in &containers {
            self.manager
                .update_node(work, *index, &Node::Container(*container))?;
        }
        debug!(
            "inode {ino}: {} extents, {} blocks, {} containers",
            extents.len(),
            block_count,
            containers.len()
        );
        Ok(containers.into_iter().map(|(index, _)| index).collect())
    }
}
