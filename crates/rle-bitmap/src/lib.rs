//! A run-length encoded bitmap over a fixed address space.
//!
//! `RleBitmap` stores the allocated indices of `[0, capacity)` as a sorted
//! list of maximal runs. Two adjacent runs never touch: setting a range that
//! borders or overlaps existing runs coalesces them into one.
//!
//! # Run nodes
//!
//! Every run lives in its own list node. The `*_no_alloc` operations never
//! allocate nodes themselves: a node needed for a new run is taken from a
//! caller-supplied [`FreeList`], and nodes released by merging or clearing are
//! handed back to it. A caller that must not allocate at mutation time fills
//! the free list in advance and reuses it.
//!
//! At most one node is consumed by any single `set_no_alloc` or
//! `clear_no_alloc` call.
//!
//! # Examples
//!
//! ```
//! use rle_bitmap::{FreeList, RleBitmap};
//!
//! let mut bitmap = RleBitmap::new(64);
//! let mut free_list = FreeList::with_nodes(2);
//!
//! bitmap.set_no_alloc(1, 5, &mut free_list).unwrap();
//! bitmap.set_no_alloc(5, 9, &mut free_list).unwrap(); // merged with 1..5
//! assert_eq!(bitmap.iter().cloned().collect::<Vec<_>>(), vec![1..9]);
//!
//! bitmap.clear_no_alloc(3, 6, &mut free_list).unwrap(); // split
//! assert_eq!(bitmap.iter().cloned().collect::<Vec<_>>(), vec![1..3, 6..9]);
//! assert_eq!(bitmap.num_bits(), 5);
//!
//! assert_eq!(bitmap.find(false, 0, 64, 3).unwrap(), 9);
//! ```
//!
//! # Performance
//!
//! - Set / clear: O(n) where n is the number of runs
//! - Find: O(n)
//! - Memory: one list node per run

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::{LinkedList, linked_list};
use core::{mem, ops::Range};

use snafu::{Snafu, ensure};
use snafu_utils::{Located, Location};

mod raw;

#[derive(Debug, Snafu)]
pub enum BitmapError {
    #[snafu(display("invalid range {lo}..{hi}"))]
    InvalidArgument {
        lo: usize,
        hi: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("range end {hi} exceeds bitmap capacity {capacity}"))]
    OutOfRange {
        hi: usize,
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list has no node left for a new run"))]
    NoFreeNodes {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no run of {count} elements with allocated={allocated} in {start}..{end}"))]
    NotFound {
        allocated: bool,
        start: usize,
        end: usize,
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for BitmapError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidArgument { location, .. }
            | Self::OutOfRange { location, .. }
            | Self::NoFreeNodes { location }
            | Self::NotFound { location, .. } => *location,
        }
    }
}

/// A single detached run node.
type Node = LinkedList<Range<usize>>;

/// Detaches the first node of `list`, returning its run and the node.
fn pop_node(list: &mut LinkedList<Range<usize>>) -> Option<(Range<usize>, Node)> {
    let run = list.front()?.clone();
    let rest = list.split_off(1);
    let node = mem::replace(list, rest);
    Some((run, node))
}

fn set_node(node: &mut Node, run: Range<usize>) {
    if let Some(slot) = node.front_mut() {
        *slot = run;
    }
}

/// Spare run nodes handed to the `*_no_alloc` operations.
#[derive(Debug, Default)]
pub struct FreeList {
    nodes: LinkedList<Range<usize>>,
}

impl FreeList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a free list holding `count` spare nodes.
    #[must_use]
    pub fn with_nodes(count: usize) -> Self {
        let mut list = Self::new();
        list.fill_to(count);
        list
    }

    /// Allocates spare nodes until the list holds at least `count`.
    pub fn fill_to(&mut self, count: usize) {
        while self.nodes.len() < count {
            self.nodes.push_back(0..0);
        }
    }

    /// Drops spare nodes until the list holds at most `count`.
    pub fn truncate(&mut self, count: usize) {
        if self.nodes.len() > count {
            drop(self.nodes.split_off(count));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn take(&mut self) -> Option<Node> {
        let len = self.nodes.len();
        (len > 0).then(|| self.nodes.split_off(len - 1))
    }

    fn give(&mut self, mut node: Node) {
        self.nodes.append(&mut node);
    }
}

/// A run-length encoded set of allocated indices in `[0, capacity)`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct RleBitmap {
    runs: LinkedList<Range<usize>>,
    capacity: usize,
    num_bits: usize,
}

impl RleBitmap {
    /// Creates an empty bitmap covering `[0, capacity)`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: LinkedList::new(),
            capacity,
            num_bits: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of allocated indices.
    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    #[must_use]
    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    /// Returns an iterator over the allocated runs in ascending order.
    pub fn iter(&self) -> linked_list::Iter<'_, Range<usize>> {
        self.runs.iter()
    }

    /// Extends the address space to `capacity`. New indices are free.
    pub fn grow(&mut self, capacity: usize) -> Result<(), BitmapError> {
        ensure!(
            capacity >= self.capacity,
            InvalidArgumentSnafu {
                lo: self.capacity,
                hi: capacity,
            }
        );
        self.capacity = capacity;
        Ok(())
    }

    /// Returns `true` if every index in `range` is allocated.
    ///
    /// An empty range is trivially allocated.
    #[must_use]
    pub fn get(&self, range: Range<usize>) -> bool {
        range.is_empty()
            || self
                .runs
                .iter()
                .any(|r| r.start <= range.start && range.end <= r.end)
    }

    /// Returns the first free index in `range`, if any.
    #[must_use]
    pub fn first_unset(&self, range: Range<usize>) -> Option<usize> {
        let mut cursor = range.start;
        for run in &self.runs {
            if run.end <= cursor {
                continue;
            }
            if run.start > cursor {
                break;
            }
            cursor = run.end;
        }
        (cursor < range.end).then_some(cursor)
    }

    fn check(&self, lo: usize, hi: usize) -> Result<(), BitmapError> {
        ensure!(lo < hi, InvalidArgumentSnafu { lo, hi });
        ensure!(
            hi <= self.capacity,
            OutOfRangeSnafu {
                hi,
                capacity: self.capacity,
            }
        );
        Ok(())
    }

    /// Marks `[lo, hi)` allocated, drawing a node from `free_list` if a new
    /// run is needed.
    ///
    /// Nodes released by coalescing are returned to `free_list`. On error the
    /// bitmap is unchanged.
    pub fn set_no_alloc(
        &mut self,
        lo: usize,
        hi: usize,
        free_list: &mut FreeList,
    ) -> Result<(), BitmapError> {
        self.check(lo, hi)?;
        let touches = self.runs.iter().any(|r| r.start <= hi && lo <= r.end);
        ensure!(touches || !free_list.is_empty(), NoFreeNodesSnafu);

        let mut rest = mem::take(&mut self.runs);
        let mut merged = lo..hi;
        let mut merged_node = None;
        let mut absorbed = 0;
        while let Some((run, mut node)) = pop_node(&mut rest) {
            if run.end < merged.start {
                self.runs.append(&mut node);
                continue;
            }
            if merged.end < run.start {
                node.append(&mut rest);
                rest = node;
                break;
            }
            absorbed += run.len();
            merged.start = usize::min(merged.start, run.start);
            merged.end = usize::max(merged.end, run.end);
            if merged_node.is_none() {
                merged_node = Some(node);
            } else {
                free_list.give(node);
            }
        }

        let Some(mut node) = merged_node.or_else(|| free_list.take()) else {
            unreachable!("free list checked before mutation");
        };
        self.num_bits = self.num_bits - absorbed + merged.len();
        set_node(&mut node, merged);
        self.runs.append(&mut node);
        self.runs.append(&mut rest);
        Ok(())
    }

    /// Marks `[lo, hi)` free, drawing a node from `free_list` if a run has
    /// to be split in two.
    ///
    /// Nodes of runs that vanish are returned to `free_list`. On error the
    /// bitmap is unchanged.
    pub fn clear_no_alloc(
        &mut self,
        lo: usize,
        hi: usize,
        free_list: &mut FreeList,
    ) -> Result<(), BitmapError> {
        self.check(lo, hi)?;
        let splits = self.runs.iter().any(|r| r.start < lo && hi < r.end);
        ensure!(!splits || !free_list.is_empty(), NoFreeNodesSnafu);

        let mut rest = mem::take(&mut self.runs);
        let mut removed = 0;
        while let Some((run, mut node)) = pop_node(&mut rest) {
            if run.end <= lo {
                self.runs.append(&mut node);
                continue;
            }
            if hi <= run.start {
                self.runs.append(&mut node);
                break;
            }
            removed += usize::min(run.end, hi) - usize::max(run.start, lo);
            let head = run.start..lo;
            let tail = hi..run.end;
            match (head.is_empty(), tail.is_empty()) {
                (true, true) => free_list.give(node),
                (false, true) => {
                    set_node(&mut node, head);
                    self.runs.append(&mut node);
                }
                (true, false) => {
                    set_node(&mut node, tail);
                    self.runs.append(&mut node);
                }
                (false, false) => {
                    set_node(&mut node, head);
                    self.runs.append(&mut node);
                    let Some(mut extra) = free_list.take() else {
                        unreachable!("free list checked before mutation");
                    };
                    set_node(&mut extra, tail);
                    self.runs.append(&mut extra);
                }
            }
        }
        self.runs.append(&mut rest);
        self.num_bits -= removed;
        Ok(())
    }

    /// Marks `[lo, hi)` allocated, allocating a run node if needed.
    pub fn set(&mut self, lo: usize, hi: usize) -> Result<(), BitmapError> {
        let mut free_list = FreeList::with_nodes(1);
        self.set_no_alloc(lo, hi, &mut free_list)
    }

    /// Marks `[lo, hi)` free, allocating a run node if needed.
    pub fn clear(&mut self, lo: usize, hi: usize) -> Result<(), BitmapError> {
        let mut free_list = FreeList::with_nodes(1);
        self.clear_no_alloc(lo, hi, &mut free_list)
    }

    /// Finds the first index `i` in `[start, end)` such that
    /// `[i, i + count)` lies inside `[start, end)` and every index in it is
    /// allocated (or free, if `allocated` is `false`).
    ///
    /// The search is first-fit.
    pub fn find(
        &self,
        allocated: bool,
        start: usize,
        end: usize,
        count: usize,
    ) -> Result<usize, BitmapError> {
        self.check(start, end)?;
        ensure!(count > 0, InvalidArgumentSnafu { lo: start, hi: end });
        let not_found = || {
            NotFoundSnafu {
                allocated,
                start,
                end,
                count,
            }
            .build()
        };

        if allocated {
            for run in &self.runs {
                if run.start >= end {
                    break;
                }
                let lo = usize::max(run.start, start);
                let hi = usize::min(run.end, end);
                if hi > lo && hi - lo >= count {
                    return Ok(lo);
                }
            }
            return Err(not_found());
        }

        let mut cursor = start;
        for run in &self.runs {
            if run.end <= cursor {
                continue;
            }
            if run.start >= end {
                break;
            }
            if run.start > cursor && run.start - cursor >= count {
                return Ok(cursor);
            }
            cursor = run.end;
            if cursor >= end {
                return Err(not_found());
            }
        }
        if end - cursor >= count {
            Ok(cursor)
        } else {
            Err(not_found())
        }
    }

    /// Appends a run past every existing run without touching its neighbours.
    fn push_run(&mut self, run: Range<usize>) {
        debug_assert!(self.runs.back().is_none_or(|last| last.end < run.start));
        self.num_bits += run.len();
        self.runs.push_back(run);
    }
}

impl<'a> IntoIterator for &'a RleBitmap {
    type Item = &'a Range<usize>;
    type IntoIter = linked_list::Iter<'a, Range<usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}
