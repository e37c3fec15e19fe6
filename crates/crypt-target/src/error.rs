use thiserror::Error;

use encryption::EncryptionError;

/// Failures of the target's control surface.
///
/// Request failures never show up here; they travel to the caller as the
/// [`common::IoError`] a bio completes with.
#[derive(Debug, Error)]
pub enum CryptError {
    /// The table line or configuration is unusable.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Cipher, IV or key selection rejected by the encryption layer.
    #[error("Encryption setup failed: {source}")]
    Encryption {
        #[from]
        source: EncryptionError,
    },

    /// The underlying device named on the table line is not registered.
    #[error("Device lookup failed: {0}")]
    DeviceLookup(String),

    /// Resume attempted without a usable key.
    #[error("Aborting resume - crypt key is not set.")]
    KeyNotSet,

    /// Key manipulation attempted on a live device.
    #[error("Not suspended during key manipulation")]
    NotSuspended,

    /// `key set` with a key of a different size than the device uses.
    #[error("Key size mismatch: device uses {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    /// Anything the message interface does not understand.
    #[error("Unrecognised message received: {0}")]
    InvalidMessage(String),

    /// The worker runtime could not be started.
    #[error("Failed to start crypt workers: {0}")]
    Dispatcher(#[source] std::io::Error),
}

impl CryptError {
    pub fn config(reason: impl Into<String>) -> Self {
        CryptError::Config {
            reason: reason.into(),
        }
    }
}

/// Result type alias for target control operations
pub type Result<T> = std::result::Result<T, CryptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CryptError::config("Not enough arguments").to_string(),
            "Invalid configuration: Not enough arguments"
        );
        assert_eq!(
            CryptError::KeyNotSet.to_string(),
            "Aborting resume - crypt key is not set."
        );
    }

    #[test]
    fn test_wraps_encryption_error() {
        let err: CryptError = EncryptionError::UnsupportedIvMode("lmk".into()).into();
        assert!(matches!(err, CryptError::Encryption { .. }));
        assert!(err.to_string().contains("Invalid IV mode: lmk"));
    }
}
