use thiserror::Error;

use common::Sector;

/// Errors raised by the simulated device outside the bio path.
///
/// Bio failures are reported as [`common::IoError`] through the completion
/// callback; these cover opening and direct sector access.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("Capacity must be at least one sector")]
    ZeroCapacity,

    #[error("Access beyond end of device: sector {sector} + {sectors} > {capacity}")]
    OutOfRange {
        sector: Sector,
        sectors: u64,
        capacity: u64,
    },

    #[error("Buffer of {0} bytes is not a whole number of sectors")]
    UnalignedBuffer(usize),

    #[error("Backing store I/O failed: {0}")]
    Backing(#[from] std::io::Error),
}

/// Result type alias for device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BlockDeviceError::OutOfRange {
            sector: 10,
            sectors: 4,
            capacity: 12,
        };
        assert_eq!(
            err.to_string(),
            "Access beyond end of device: sector 10 + 4 > 12"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: BlockDeviceError = io.into();
        assert!(err.to_string().contains("disk on fire"));
    }
}
