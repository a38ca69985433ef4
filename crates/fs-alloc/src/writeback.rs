use alloc::{sync::Arc, vec::Vec};

use log::debug;
use snafu::ResultExt as _;

use crate::{
    device::BlockDevice,
    error::{DeviceSnafu, FsError},
    operation::{BufferedOperation, OperationKind},
};

/// Receives the operations of a committing transaction and makes them
/// durable.
///
/// Metadata must be durable before the call returns; data may be written in
/// any order relative to it, but also before returning.
pub trait Writeback: Send + Sync {
    fn commit(
        &self,
        metadata: Vec<BufferedOperation>,
        data: Vec<BufferedOperation>,
    ) -> Result<(), FsError>;
}

/// Writes straight to the device: metadata, flush, data, flush.
///
/// Offers no crash atomicity across the metadata list; a journal would sit
/// in its place for that.
pub struct DirectWriteback {
    device: Arc<dyn BlockDevice>,
}

impl DirectWriteback {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self { device }
    }

    fn issue(&self, operations: &[BufferedOperation]) -> Result<(), FsError> {
        for operation in operations {
            let op = operation.op;
            match op.kind {
                OperationKind::Write => self
                    .device
                    .write_blocks(op.dev_block, &operation.data)
                    .context(DeviceSnafu)?,
                OperationKind::Trim => self
                    .device
                    .trim_blocks(op.dev_block, op.block_count)
                    .context(DeviceSnafu)?,
                OperationKind::Read => {
                    debug!("ignoring queued {op}");
                }
            }
        }
        self.device.flush().context(DeviceSnafu)
    }
}

impl Writeback for DirectWriteback {
    fn commit(
        &self,
        metadata: Vec<BufferedOperation>,
        data: Vec<BufferedOperation>,
    ) -> Result<(), FsError> {
        debug!(
            "writing back {} metadata and {} data operations",
            metadata.len(),
            data.len()
        );
        self.issue(&metadata)?;
        self.issue(&data)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{device::RamDevice, layout::BLOCK_SIZE};

    #[test]
    fn test_writes_and_trims() {
        let device = Arc::new(RamDevice::new(8));
        let writeback = DirectWriteback::new(device.clone());
        writeback
            .commit(
                vec![BufferedOperation::write(1, vec![5; BLOCK_SIZE])],
                vec![
                    BufferedOperation::write(4, vec![6; BLOCK_SIZE * 2]),
                    BufferedOperation::trim(5, 1),
                ],
            )
            .unwrap();

        let mut buf = vec![0; BLOCK_SIZE * 5];
        device.read_blocks(1, &mut buf).unwrap();
        assert_eq!(buf[0], 5);
        assert_eq!(buf[BLOCK_SIZE * 3], 6);
        assert_eq!(buf[BLOCK_SIZE * 4], 0);
    }

    #[test]
    fn test_device_failure_is_reported() {
        let device = Arc::new(RamDevice::new(8));
        device.set_fail_writes(true);
        let writeback = DirectWriteback::new(device.clone());
        let err = writeback
            .commit(vec![BufferedOperation::write(1, vec![5; BLOCK_SIZE])], vec![])
            .unwrap_err();
        assert!(err.kind().is_io());
    }
}
