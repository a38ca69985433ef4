//! Reservation-based element allocator.
//!
//! An [`Allocator`] hands out indices of one pool (blocks or inodes). Space
//! is claimed up front with [`Allocator::reserve`]; individual indices are
//! then taken from the [`AllocatorReservation`] and only reach the on-disk
//! bitmap when the reservation is committed into a transaction.
//!
//! The in-memory bitmap always includes indices handed out by uncommitted
//! reservations, so no index is ever given out twice. Indices freed through
//! a reservation stay allocated until commit.

use alloc::{boxed::Box, vec::Vec};
use core::{fmt, ops::Range};

use log::{debug, trace, warn};
use rle_bitmap::{FreeList, RleBitmap};
use snafu::{ResultExt as _, ensure};
use snafu_utils::Report;
use spin::Mutex;

pub use self::reservation::AllocatorReservation;
use crate::{
    buffer::SharedBuffer,
    error::{BitmapSnafu, FsError, OutOfSpaceSnafu},
    operation::{PendingWork, ReadBatch},
    storage::{AllocatorMetadata, AllocatorStorage, PoolKind},
};

mod reservation;

struct AllocatorInner {
    storage: Box<dyn AllocatorStorage>,
    map: RleBitmap,
    nodes: FreeList,
    reserved: usize,
    hint: usize,
}

impl AllocatorInner {
    fn available(&self) -> usize {
        self.map.capacity() - self.map.num_bits() - self.reserved
    }

    fn clear_one(&mut self, index: usize) {
        self.nodes.fill_to(1);
        if let Err(err) = self.map.clear_no_alloc(index, index + 1, &mut self.nodes) {
            panic!("failed to clear {index}: {}", Report::new(&err));
        }
        self.hint = usize::min(self.hint, index);
    }

    /// Keeps one spare node per reserved element and no more.
    fn trim_nodes(&mut self) {
        self.nodes.truncate(self.reserved);
    }
}

/// Allocator of one element pool.
pub struct Allocator {
    kind: PoolKind,
    inner: Mutex<AllocatorInner>,
}

/// An allocator whose bitmap read is scheduled but not yet run.
pub struct AllocatorLoader {
    storage: Box<dyn AllocatorStorage>,
    buffer: SharedBuffer,
}

impl AllocatorLoader {
    /// Builds the allocator from the bitmap read by the batch.
    #[must_use]
    pub fn finish(self) -> Allocator {
        let total = self.storage.pool_total();
        let map = RleBitmap::from_raw(total, self.buffer.lock().as_bytes());
        Allocator::from_parts(self.storage, map)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Allocator")
            .field("kind", &self.kind)
            .field("total", &inner.map.capacity())
            .field("allocated", &inner.map.num_bits())
            .field("reserved", &inner.reserved)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Schedules the load of the pool's bitmap into `batch`.
    ///
    /// Run the batch, then call [`AllocatorLoader::finish`].
    pub fn create(batch: &mut ReadBatch, storage: Box<dyn AllocatorStorage>) -> AllocatorLoader {
        let buffer = SharedBuffer::new(0);
        storage.load(batch, &buffer);
        AllocatorLoader { storage, buffer }
    }

    /// Creates an allocator with an explicit initial bitmap.
    #[must_use]
    pub fn from_parts(storage: Box<dyn AllocatorStorage>, map: RleBitmap) -> Self {
        let kind = storage.kind();
        debug!(
            "{kind} allocator: {} of {} allocated in {} runs",
            map.num_bits(),
            map.capacity(),
            map.num_runs()
        );
        Self {
            kind,
            inner: Mutex::new(AllocatorInner {
                storage,
                map,
                nodes: FreeList::new(),
                reserved: 0,
                hint: 0,
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    #[must_use]
    pub fn pool_total(&self) -> usize {
        self.inner.lock().map.capacity()
    }

    /// Elements neither allocated nor reserved.
    #[must_use]
    pub fn pool_available(&self) -> usize {
        self.inner.lock().available()
    }

    /// Elements allocated in memory, including uncommitted allocations.
    #[must_use]
    pub fn pool_allocated(&self) -> usize {
        self.inner.lock().map.num_bits()
    }

    #[must_use]
    pub fn pool_reserved(&self) -> usize {
        self.inner.lock().reserved
    }

    #[must_use]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.inner.lock().map.get(index..index + 1)
    }

    #[must_use]
    pub fn metadata(&self) -> AllocatorMetadata {
        self.inner.lock().storage.metadata()
    }

    /// Allocated runs, for diagnostics.
    #[must_use]
    pub fn runs(&self) -> Vec<Range<usize>> {
        self.inner.lock().map.iter().cloned().collect()
    }

    /// First-fit search for `count` contiguous elements in `range` whose
    /// state matches `allocated`.
    pub fn find(
        &self,
        allocated: bool,
        range: Range<usize>,
        count: usize,
    ) -> Result<usize, FsError> {
        self.inner
            .lock()
            .map
            .find(allocated, range.start, range.end, count)
            .context(BitmapSnafu)
    }

    /// Starts a reservation of `count` elements.
    pub fn reserve(
        &self,
        work: &mut dyn PendingWork,
        count: usize,
    ) -> Result<AllocatorReservation<'_>, FsError> {
        let mut reservation = AllocatorReservation::new(self);
        reservation.reserve(work, count)?;
        Ok(reservation)
    }

    /// Takes one element out of `reservation`.
    ///
    /// # Panics
    ///
    /// Panics if the reservation is exhausted or belongs to another
    /// allocator.
    pub fn allocate(&self, reservation: &mut AllocatorReservation<'_>) -> usize {
        self.check_owner(reservation);
        reservation.allocate()
    }

    /// Frees `index`.
    ///
    /// With a reservation the free is deferred until it commits; without
    /// one the bitmap and its persistent form are updated immediately.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not allocated.
    pub fn free(
        &self,
        reservation: Option<&mut AllocatorReservation<'_>>,
        work: &mut dyn PendingWork,
        index: usize,
    ) {
        if let Some(reservation) = reservation {
            self.check_owner(reservation);
            reservation.deallocate(index);
            return;
        }
        let mut inner = self.inner.lock();
        assert!(
            inner.map.get(index..index + 1),
            "freeing unallocated {} {index}",
            self.kind
        );
        inner.clear_one(index);
        let AllocatorInner { storage, map, .. } = &mut *inner;
        storage.persist_release(work, map, index, 1);
        trace!("freed {} {index}", self.kind);
    }

    /// Persists `reservation`'s pending work into `work` and returns its
    /// unused count to the pool.
    pub fn commit(&self, work: &mut dyn PendingWork, reservation: &mut AllocatorReservation<'_>) {
        self.check_owner(reservation);
        reservation.commit(work);
    }

    /// Returns `count` reserved elements to the pool.
    pub fn unreserve(&self, count: usize) {
        let mut inner = self.inner.lock();
        assert!(
            inner.reserved >= count,
            "unreserving {count} {} elements, only {} reserved",
            self.kind,
            inner.reserved
        );
        inner.reserved -= count;
        inner.trim_nodes();
    }

    fn check_owner(&self, reservation: &AllocatorReservation<'_>) {
        assert!(
            core::ptr::eq(reservation.allocator(), self),
            "reservation belongs to another allocator"
        );
    }

    fn reserve_elements(&self, work: &mut dyn PendingWork, count: usize) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        if inner.available() < count {
            let AllocatorInner { storage, map, .. } = &mut *inner;
            match storage.extend(work, map) {
                Ok(()) => debug!("{} pool extended to {}", self.kind, map.capacity()),
                Err(err @ FsError::CannotExtend { .. }) => {
                    debug!("{} pool not extended: {}", self.kind, Report::new(&err));
                }
                Err(err) => warn!("failed to extend {} pool: {}", self.kind, Report::new(&err)),
            }
            let available = inner.available();
            ensure!(
                available >= count,
                OutOfSpaceSnafu {
                    pool: self.kind,
                    requested: count,
                    available,
                }
            );
        }
        inner.reserved += count;
        let reserved = inner.reserved;
        inner.nodes.fill_to(reserved);
        trace!("reserved {count} {} elements", self.kind);
        Ok(())
    }

    fn allocate_one(&self) -> usize {
        let mut inner = self.inner.lock();
        assert!(inner.reserved > 0, "allocating without a reservation");
        let AllocatorInner {
            map, nodes, hint, ..
        } = &mut *inner;
        let capacity = map.capacity();
        let index = map
            .find(false, *hint, capacity, 1)
            .or_else(|_| map.find(false, 0, capacity, 1))
            .unwrap_or_else(|err| {
                panic!(
                    "reserved {} element missing from the bitmap: {}",
                    self.kind,
                    Report::new(&err)
                )
            });
        if let Err(err) = map.set_no_alloc(index, index + 1, nodes) {
            panic!("failed to mark {index} allocated: {}", Report::new(&err));
        }
        *hint = index + 1;
        inner.reserved -= 1;
        trace!("allocated {} {index}", self.kind);
        index
    }

    fn rollback(&self, allocations: &[usize]) {
        let mut inner = self.inner.lock();
        for &index in allocations {
            inner.clear_one(index);
        }
        inner.trim_nodes();
        trace!("rolled back {} {} allocations", allocations.len(), self.kind);
    }

    fn commit_pending(
        &self,
        work: &mut dyn PendingWork,
        allocations: &mut Vec<usize>,
        deallocations: &mut Vec<usize>,
        leftover: usize,
    ) {
        let mut inner = self.inner.lock();
        for run in coalesce(allocations) {
            let AllocatorInner { storage, map, .. } = &mut *inner;
            storage.persist_allocate(work, map, run.start, run.len());
        }
        let freed = coalesce(deallocations);
        for run in &freed {
            for index in run.clone() {
                inner.clear_one(index);
            }
        }
        for run in freed {
            let AllocatorInner { storage, map, .. } = &mut *inner;
            storage.persist_release(work, map, run.start, run.len());
        }
        assert!(inner.reserved >= leftover);
        inner.reserved -= leftover;
        inner.trim_nodes();
        debug!(
            "committed {} allocations and {} frees of {}, returned {leftover}",
            allocations.len(),
            deallocations.len(),
            self.kind
        );
    }
}

/// Sorts and deduplicates `indices`, returning them as maximal runs.
fn coalesce(indices: &mut Vec<usize>) -> Vec<Range<usize>> {
    indices.sort_unstable();
    indices.dedup();
    let mut runs: Vec<Range<usize>> = Vec::new();
    for &index in indices.iter() {
        match runs.last_mut() {
            Some(run) if run.end == index => run.end += 1,
            _ => runs.push(index..index + 1),
        }
    }
    runs
}
