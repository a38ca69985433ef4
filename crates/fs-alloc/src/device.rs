//! Block transport.
//!
//! The allocator issues whole-block reads and writes through
//! [`BlockDevice`]. Volume growth (FVM slices) goes through
//! [`BlockDevice::extend`], which plain devices do not support.

use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, Ordering};

use snafu::{Snafu, ensure};
use snafu_utils::{Located, Location};
use spin::Mutex;

use crate::layout::BLOCK_SIZE;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeviceError {
    #[snafu(display("blocks {block}..{end} outside of device ({block_count} blocks)"))]
    OutOfRange {
        block: u64,
        end: u64,
        block_count: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer of {len} bytes is not a whole number of blocks"))]
    BufferSize {
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no space left on the volume"))]
    NoSpace {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{op} is not supported by this device"))]
    Unsupported {
        op: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("i/o failed: {reason}"))]
    Io {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for DeviceError {
    fn location(&self) -> Location {
        match self {
            Self::OutOfRange { location, .. }
            | Self::BufferSize { location, .. }
            | Self::NoSpace { location, .. }
            | Self::Unsupported { location, .. }
            | Self::Io { location, .. } => *location,
        }
    }
}

/// Slice geometry of a volume-managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Size of one slice in bytes.
    pub slice_size: u64,
    /// Physical slices backing the volume group.
    pub slice_count: u64,
    /// Slices currently mapped into this volume.
    pub allocated_slices: u64,
}

pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Reads `buf.len() / block_size()` blocks starting at `block`.
    fn read_blocks(&self, block: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes `buf.len() / block_size()` blocks starting at `block`.
    fn write_blocks(&self, block: u64, buf: &[u8]) -> Result<(), DeviceError>;

    fn trim_blocks(&self, _block: u64, _count: u64) -> Result<(), DeviceError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Returns the slice geometry if the device sits on a volume manager.
    fn volume_info(&self) -> Option<VolumeInfo> {
        None
    }

    /// Maps `slice_count` virtual slices starting at `slice_offset`.
    fn extend(&self, _slice_offset: u64, _slice_count: u64) -> Result<(), DeviceError> {
        UnsupportedSnafu { op: "extend" }.fail()
    }
}

#[derive(Debug)]
struct Fvm {
    slice_blocks: u64,
    slice_count: u64,
    allocated: BTreeSet<u64>,
}

/// A sparse in-memory device.
///
/// Blocks that were never written read back as zeros. A device created with
/// [`RamDevice::with_fvm`] behaves like a volume-managed partition: only
/// blocks inside mapped slices are addressable, and slice 0 is mapped from
/// the start.
#[derive(Debug)]
pub struct RamDevice {
    block_count: u64,
    blocks: Mutex<BTreeMap<u64, Box<[u8]>>>,
    fvm: Option<Mutex<Fvm>>,
    fail_writes: AtomicBool,
}

impl RamDevice {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            blocks: Mutex::new(BTreeMap::new()),
            fvm: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Creates a volume-managed device of `slice_count` physical slices of
    /// `slice_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `slice_size` is not a multiple of the block size.
    #[must_use]
    pub fn with_fvm(slice_size: u64, slice_count: u64) -> Self {
        let block_size = BLOCK_SIZE as u64;
        assert!(
            slice_size >= block_size && slice_size % block_size == 0,
            "slice size {slice_size} is not a multiple of the block size"
        );
        let mut allocated = BTreeSet::new();
        allocated.insert(0);
        Self {
            block_count: 1 << 32,
            blocks: Mutex::new(BTreeMap::new()),
            fvm: Some(Mutex::new(Fvm {
                slice_blocks: slice_size / block_size,
                slice_count,
                allocated,
            })),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every following write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn check_buffer(&self, block: u64, len: usize) -> Result<(), DeviceError> {
        ensure!(len % BLOCK_SIZE == 0, BufferSizeSnafu { len });
        self.check_range(block, (len / BLOCK_SIZE) as u64)
    }

    fn check_range(&self, block: u64, count: u64) -> Result<(), DeviceError> {
        let end = block.saturating_add(count);
        let out_of_range = OutOfRangeSnafu {
            block,
            end,
            block_count: self.block_count,
        };
        ensure!(end <= self.block_count, out_of_range);
        if let Some(fvm) = &self.fvm
            && count > 0
        {
            let fvm = fvm.lock();
            let first = block / fvm.slice_blocks;
            let last = (end - 1) / fvm.slice_blocks;
            ensure!(
                (first..=last).all(|slice| fvm.allocated.contains(&slice)),
                out_of_range
            );
        }
        Ok(())
    }
}

impl BlockDevice for RamDevice {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, block: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check_buffer(block, buf.len())?;
        let blocks = self.blocks.lock();
        for (index, chunk) in (block..).zip(buf.chunks_exact_mut(BLOCK_SIZE)) {
            match blocks.get(&index) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_blocks(&self, block: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.check_buffer(block, buf.len())?;
        ensure!(
            !self.fail_writes.load(Ordering::Acquire),
            IoSnafu {
                reason: "injected write failure"
            }
        );
        let mut blocks = self.blocks.lock();
        for (index, chunk) in (block..).zip(buf.chunks_exact(BLOCK_SIZE)) {
            blocks.insert(index, chunk.into());
        }
        Ok(())
    }

    fn trim_blocks(&self, block: u64, count: u64) -> Result<(), DeviceError> {
        self.check_range(block, count)?;
        let mut blocks = self.blocks.lock();
        let trimmed: Vec<u64> = blocks
            .range(block..block + count)
            .map(|(index, _)| *index)
            .collect();
        for index in trimmed {
            blocks.remove(&index);
        }
        Ok(())
    }

    fn volume_info(&self) -> Option<VolumeInfo> {
        let fvm = self.fvm.as_ref()?.lock();
        Some(VolumeInfo {
            slice_size: fvm.slice_blocks * BLOCK_SIZE as u64,
            slice_count: fvm.slice_count,
            allocated_slices: fvm.allocated.len() as u64,
        })
    }

    fn extend(&self, slice_offset: u64, slice_count: u64) -> Result<(), DeviceError> {
        let Some(fvm) = &self.fvm else {
            return UnsupportedSnafu { op: "extend" }.fail();
        };
        let mut fvm = fvm.lock();
        let end = slice_offset.saturating_add(slice_count);
        let virtual_slices = self.block_count / fvm.slice_blocks;
        ensure!(
            end <= virtual_slices,
            OutOfRangeSnafu {
                block: slice_offset * fvm.slice_blocks,
                end: end.saturating_mul(fvm.slice_blocks),
                block_count: self.block_count,
            }
        );
        let fresh = (slice_offset..end)
            .filter(|slice| !fvm.allocated.contains(slice))
            .count() as u64;
        ensure!(
            fvm.allocated.len() as u64 + fresh <= fvm.slice_count,
            NoSpaceSnafu
        );
        fvm.allocated.extend(slice_offset..end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn test_unwritten_blocks_read_as_zero() {
        let device = RamDevice::new(4);
        let mut buf = vec![0xaa_u8; BLOCK_SIZE * 2];
        device.read_blocks(2, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        let data = vec![7_u8; BLOCK_SIZE];
        device.write_blocks(3, &data).unwrap();
        device.read_blocks(2, &mut buf).unwrap();
        assert!(buf[..BLOCK_SIZE].iter().all(|b| *b == 0));
        assert!(buf[BLOCK_SIZE..].iter().all(|b| *b == 7));
    }

    #[test]
    fn test_bounds_and_buffer_size() {
        let device = RamDevice::new(4);
        let mut buf = vec![0_u8; BLOCK_SIZE];
        assert!(matches!(
            device.read_blocks(4, &mut buf),
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            device.write_blocks(0, &buf[..100]),
            Err(DeviceError::BufferSize { .. })
        ));
        assert!(matches!(
            device.extend(1, 1),
            Err(DeviceError::Unsupported { .. })
        ));
        assert!(device.volume_info().is_none());
    }

    #[test]
    fn test_trim_discards_contents() {
        let device = RamDevice::new(4);
        device.write_blocks(1, &vec![1_u8; BLOCK_SIZE * 2]).unwrap();
        device.trim_blocks(1, 1).unwrap();
        let mut buf = vec![0_u8; BLOCK_SIZE * 2];
        device.read_blocks(1, &mut buf).unwrap();
        assert!(buf[..BLOCK_SIZE].iter().all(|b| *b == 0));
        assert!(buf[BLOCK_SIZE..].iter().all(|b| *b == 1));
    }

    #[test]
    fn test_fvm_slices_must_be_mapped() {
        let slice_size = (BLOCK_SIZE * 4) as u64;
        let device = RamDevice::with_fvm(slice_size, 3);
        let buf = vec![0_u8; BLOCK_SIZE];
        device.write_blocks(3, &buf).unwrap();
        assert!(device.write_blocks(8, &buf).is_err());

        device.extend(2, 1).unwrap();
        device.write_blocks(8, &buf).unwrap();
        assert_eq!(device.volume_info().unwrap().allocated_slices, 2);

        device.extend(5, 1).unwrap();
        assert!(matches!(
            device.extend(6, 1),
            Err(DeviceError::NoSpace { .. })
        ));
    }

    #[test]
    fn test_injected_write_failure() {
        let device = RamDevice::new(2);
        device.set_fail_writes(true);
        assert!(matches!(
            device.write_blocks(0, &vec![0_u8; BLOCK_SIZE]),
            Err(DeviceError::Io { .. })
        ));
        device.set_fail_writes(false);
        device.write_blocks(0, &vec![0_u8; BLOCK_SIZE]).unwrap();
    }
}
