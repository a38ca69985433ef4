use alloc::string::String;

use derive_more::IsVariant;
use rle_bitmap::BitmapError;
use snafu::Snafu;
use snafu_utils::{Located, Location};

use crate::{device::DeviceError, storage::PoolKind};

/// Errors returned by the allocator, its storage and transactions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FsError {
    #[snafu(display("{pool} pool exhausted: requested {requested}, available {available}"))]
    OutOfSpace {
        pool: PoolKind,
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{pool} pool cannot grow: {reason}"))]
    CannotExtend {
        pool: PoolKind,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("bitmap operation failed"))]
    Bitmap {
        source: BitmapError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no {what} found"))]
    NotFound {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("corrupted node chain at node {node}: {reason}"))]
    IoDataIntegrity {
        node: u32,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("device request failed"))]
    Device {
        source: DeviceError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid superblock: {reason}"))]
    InvalidSuperblock {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid {what}: {value} (limit {limit})"))]
    InvalidArgument {
        what: &'static str,
        value: u64,
        limit: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("filesystem is read-only"))]
    ReadOnly {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Coarse classification of [`FsError`].
///
/// Lets callers tell resource exhaustion apart from on-disk corruption
/// without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum ErrorKind {
    OutOfSpace,
    InvalidArgument,
    NotFound,
    IoDataIntegrity,
    Io,
    ReadOnly,
}

impl FsError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfSpace { .. } | Self::CannotExtend { .. } => ErrorKind::OutOfSpace,
            Self::Bitmap { source, .. } => match source {
                BitmapError::NotFound { .. } => ErrorKind::NotFound,
                BitmapError::NoFreeNodes { .. } => ErrorKind::OutOfSpace,
                BitmapError::InvalidArgument { .. } | BitmapError::OutOfRange { .. } => {
                    ErrorKind::InvalidArgument
                }
            },
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::IoDataIntegrity { .. } | Self::InvalidSuperblock { .. } => {
                ErrorKind::IoDataIntegrity
            }
            Self::Device { .. } => ErrorKind::Io,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ReadOnly { .. } => ErrorKind::ReadOnly,
        }
    }
}

impl Located for FsError {
    fn location(&self) -> Location {
        match self {
            Self::OutOfSpace { location, .. }
            | Self::CannotExtend { location, .. }
            | Self::Bitmap { location, .. }
            | Self::NotFound { location, .. }
            | Self::IoDataIntegrity { location, .. }
            | Self::Device { location, .. }
            | Self::InvalidSuperblock { location, .. }
            | Self::InvalidArgument { location, .. }
            | Self::ReadOnly { location, .. } => *location,
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::{IntoError as _, ResultExt as _};
    use snafu_utils::Report;

    use super::*;

    #[test]
    fn test_kind_classifies_bitmap_errors() {
        let mut bitmap = rle_bitmap::RleBitmap::new(4);
        bitmap.set(0, 4).unwrap();
        let err = bitmap.find(false, 0, 4, 1).context(BitmapSnafu).unwrap_err();
        assert!(err.kind().is_not_found());

        let err = bitmap.set(3, 9).context(BitmapSnafu).unwrap_err();
        assert!(err.kind().is_invalid_argument());
    }

    #[test]
    fn test_report_includes_source() {
        let err = DeviceSnafu.into_error(DeviceError::NoSpace {
            location: Location::default(),
        });
        let text = Report::new(&err).to_string();
        assert!(text.starts_with("device request failed (at "));
        assert!(text.contains("no space left on the volume"));
        assert!(err.kind().is_io());
    }
}
