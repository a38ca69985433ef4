use alloc::vec::Vec;
use core::{fmt, mem};

use log::{trace, warn};

use super::Allocator;
use crate::{error::FsError, operation::PendingWork};

/// Elements set aside for one transaction.
///
/// Dropping a reservation that was not committed cancels it: unused
/// elements go back to the pool, allocations are undone and deferred frees
/// are forgotten.
pub struct AllocatorReservation<'a> {
    allocator: &'a Allocator,
    reserved: usize,
    pending_allocations: Vec<usize>,
    pending_deallocations: Vec<usize>,
    committed: bool,
}

impl fmt::Debug for AllocatorReservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorReservation")
            .field("pool", &self.allocator.kind())
            .field("reserved", &self.reserved)
            .field("pending_allocations", &self.pending_allocations)
            .field("pending_deallocations", &self.pending_deallocations)
            .field("committed", &self.committed)
            .finish()
    }
}

impl<'a> AllocatorReservation<'a> {
    /// Creates an empty reservation.
    #[must_use]
    pub fn new(allocator: &'a Allocator) -> Self {
        Self {
            allocator,
            reserved: 0,
            pending_allocations: Vec::new(),
            pending_deallocations: Vec::new(),
            committed: false,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }

    /// Elements still available to [`allocate`](Self::allocate).
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn pending_allocations(&self) -> &[usize] {
        &self.pending_allocations
    }

    #[must_use]
    pub fn pending_deallocations(&self) -> &[usize] {
        &self.pending_deallocations
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Adds `count` elements to the reservation, growing the pool once if
    /// it is short.
    pub fn reserve(&mut self, work: &mut dyn PendingWork, count: usize) -> Result<(), FsError> {
        assert!(!self.committed, "reserving on a committed reservation");
        self.allocator.reserve_elements(work, count)?;
        self.reserved += count;
        self.pending_allocations.reserve(count);
        Ok(())
    }

    /// Takes one reserved element and returns its index.
    ///
    /// # Panics
    ///
    /// Panics if every reserved element has been taken.
    pub fn allocate(&mut self) -> usize {
        assert!(
            self.reserved > 0,
            "allocating from an exhausted {} reservation",
            self.allocator.kind()
        );
        let index = self.allocator.allocate_one();
        self.reserved -= 1;
        self.pending_allocations.push(index);
        index
    }

    /// Schedules `index` to be freed when the reservation commits.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not allocated or is already scheduled.
    pub fn deallocate(&mut self, index: usize) {
        assert!(!self.committed, "deallocating on a committed reservation");
        assert!(
            self.allocator.is_allocated(index),
            "freeing unallocated {} {index}",
            self.allocator.kind()
        );
        assert!(
            !self.pending_deallocations.contains(&index),
            "{} {index} freed twice",
            self.allocator.kind()
        );
        trace!("deferring free of {} {index}", self.allocator.kind());
        self.pending_deallocations.push(index);
    }

    /// Allocates a replacement for `old` and schedules `old` to be freed.
    pub fn swap(&mut self, old: Option<usize>) -> usize {
        let new = self.allocate();
        if let Some(old) = old {
            self.deallocate(old);
        }
        new
    }

    /// Persists pending allocations and frees into `work` and returns the
    /// unused count to the pool.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn commit(&mut self, work: &mut dyn PendingWork) {
        assert!(!self.committed, "reservation committed twice");
        self.committed = true;
        let leftover = mem::take(&mut self.reserved);
        let mut allocations = mem::take(&mut self.pending_allocations);
        let mut deallocations = mem::take(&mut self.pending_deallocations);
        self.allocator
            .commit_pending(work, &mut allocations, &mut deallocations, leftover);
    }

    /// Abandons the reservation. Calling it again does nothing.
    pub fn cancel(&mut self) {
        if self.reserved > 0 {
            self.allocator.unreserve(mem::take(&mut self.reserved));
        }
        if !self.pending_allocations.is_empty() {
            self.allocator.rollback(&mem::take(&mut self.pending_allocations));
        }
        self.pending_deallocations.clear();
    }
}

impl Drop for AllocatorReservation<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.pending_allocations.is_empty() {
            warn!(
                "rolling back {} uncommitted {} allocations",
                self.pending_allocations.len(),
                self.allocator.kind()
            );
        }
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use rle_bitmap::RleBitmap;

    use super::*;
    use crate::{
        operation::OperationQueue,
        storage::{InMemoryStorage, PoolKind},
    };

    fn allocator(total: usize) -> Allocator {
        Allocator::from_parts(
            InMemoryStorage::boxed(PoolKind::Inodes, total),
            RleBitmap::new(total),
        )
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 4).unwrap();
        let index = reservation.allocate();
        assert_eq!(allocator.pool_available(), 6);

        reservation.cancel();
        assert_eq!(allocator.pool_available(), 10);
        assert!(!allocator.is_allocated(index));
        reservation.cancel();
        drop(reservation);
        assert_eq!(allocator.pool_available(), 10);
        assert_eq!(allocator.pool_reserved(), 0);
    }

    #[test]
    fn test_cancel_after_full_consumption() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 2).unwrap();
        reservation.allocate();
        reservation.allocate();
        reservation.commit(&mut queue);
        reservation.cancel();
        drop(reservation);
        assert_eq!(allocator.pool_available(), 8);
        assert_eq!(allocator.pool_allocated(), 2);
    }

    #[test]
    fn test_commit_returns_leftover() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 5).unwrap();
        reservation.allocate();
        reservation.commit(&mut queue);
        assert_eq!(reservation.reserved(), 0);
        assert!(reservation.is_committed());
        assert_eq!(allocator.pool_available(), 9);
        assert_eq!(allocator.pool_reserved(), 0);
    }

    #[test]
    #[should_panic = "committed twice"]
    fn test_double_commit_panics() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 1).unwrap();
        reservation.commit(&mut queue);
        reservation.commit(&mut queue);
    }

    #[test]
    fn test_swap_defers_old_free() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut setup = allocator.reserve(&mut queue, 1).unwrap();
        let old = setup.allocate();
        setup.commit(&mut queue);
        drop(setup);

        let mut reservation = allocator.reserve(&mut queue, 1).unwrap();
        let new = reservation.swap(Some(old));
        assert_ne!(new, old);
        assert_eq!(reservation.pending_deallocations(), &[old]);
        assert!(allocator.is_allocated(old));

        reservation.commit(&mut queue);
        assert!(!allocator.is_allocated(old));
        assert!(allocator.is_allocated(new));
        assert_eq!(allocator.metadata().pool_used, 1);
    }

    #[test]
    fn test_allocate_then_free_in_same_reservation() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 1).unwrap();
        let index = reservation.allocate();
        reservation.deallocate(index);
        reservation.commit(&mut queue);
        assert!(!allocator.is_allocated(index));
        assert_eq!(allocator.metadata().pool_used, 0);
        assert_eq!(allocator.pool_available(), 10);
    }

    #[test]
    #[should_panic = "freed twice"]
    fn test_double_deallocate_panics() {
        let allocator = allocator(10);
        let mut queue = OperationQueue::new();
        let mut reservation = allocator.reserve(&mut queue, 1).unwrap();
        let index = reservation.allocate();
        reservation.deallocate(index);
        reservation.deallocate(index);
    }
}
