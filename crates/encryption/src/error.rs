use thiserror::Error;

/// Encryption-related errors
///
/// These errors are designed to be informative for debugging while
/// avoiding leaking key material into logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// Key errors
    #[error("Invalid key length for {cipher}: expected one of {expected:?}, got {actual}")]
    InvalidKeyLength {
        cipher: String,
        expected: Vec<usize>,
        actual: usize,
    },

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("No key loaded")]
    KeyNotSet,

    /// Algorithm selection errors
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Unsupported chaining mode `{mode}` for cipher `{cipher}`")]
    UnsupportedChainMode { cipher: String, mode: String },

    #[error("Invalid IV mode: {0}")]
    UnsupportedIvMode(String),

    #[error("Digest algorithm missing for ESSIV mode")]
    MissingEssivDigest,

    #[error("Unsupported ESSIV digest: {0}")]
    UnsupportedDigest(String),

    #[error("Block size of ESSIV cipher ({block_size}) does not match IV size ({iv_size})")]
    EssivBlockSizeMismatch { block_size: usize, iv_size: usize },

    #[error("Cipher block size {0} is not a power of 2")]
    BlockSizeNotPowerOfTwo(usize),

    #[error("Cipher block size {0} is larger than a sector")]
    BlockSizeTooLarge(usize),

    /// Conversion errors
    #[error("Invalid data length {len}: must be a multiple of {block_size}")]
    InvalidDataLength { len: usize, block_size: usize },

    #[error("Invalid IV length: expected at least {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    /// Wrapped errors from dependencies
    #[error("Cipher error: {0}")]
    CipherError(String),
}

/// Result type alias for encryption operations
pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Convert cipher key/IV length errors to our error type
impl From<cipher::InvalidLength> for EncryptionError {
    fn from(err: cipher::InvalidLength) -> Self {
        EncryptionError::CipherError(err.to_string())
    }
}
