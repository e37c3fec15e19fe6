use thiserror::Error;

use crate::Sector;

/// Completion status of a bio.
///
/// Every request, external or cloned, finishes with exactly one of these.
/// The type is `Clone` so a pending request can keep the first failure it
/// observed and still hand a copy to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// The underlying device failed the transfer.
    #[error("I/O error on {device} at sector {sector}: {reason}")]
    Device {
        device: String,
        sector: Sector,
        reason: String,
    },

    /// The request addresses sectors past the end of the device.
    #[error("request beyond end of {device}: sector {sector} + {sectors} exceeds {capacity}")]
    OutOfRange {
        device: String,
        sector: Sector,
        sectors: u64,
        capacity: u64,
    },

    /// A pool or allocation could not be satisfied.
    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    /// The cipher backend rejected or failed a conversion.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The target cannot service I/O right now (no key loaded, shut down).
    #[error("device not ready: {0}")]
    NotReady(String),
}

impl IoError {
    pub fn device(device: impl Into<String>, sector: Sector, reason: impl Into<String>) -> Self {
        IoError::Device {
            device: device.into(),
            sector,
            reason: reason.into(),
        }
    }

    pub fn exhausted(what: impl Into<String>) -> Self {
        IoError::ResourceExhausted(what.into())
    }

    pub fn cipher(message: impl Into<String>) -> Self {
        IoError::Cipher(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        IoError::Invalid(message.into())
    }
}

/// Result a bio completes with.
pub type IoStatus = std::result::Result<(), IoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IoError::device("loop0", 42, "medium error");
        assert_eq!(err.to_string(), "I/O error on loop0 at sector 42: medium error");

        let err = IoError::exhausted("page pool");
        assert_eq!(err.to_string(), "out of resources: page pool");
    }

    #[test]
    fn test_out_of_range_display() {
        let err = IoError::OutOfRange {
            device: "mem0".into(),
            sector: 998,
            sectors: 4,
            capacity: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("sector 998 + 4"));
        assert!(msg.contains("1000"));
    }
}
