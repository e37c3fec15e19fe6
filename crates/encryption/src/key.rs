//! Key material handling
//!
//! Keys arrive as hex strings on the table line or through the `key set`
//! message. The decoded bytes live in a [`KeyMaterial`] which zeroizes itself
//! on drop and never prints its contents through `Debug`.
//!
//! ## Encoding rules
//!
//! - `-` means "no key yet": the key is empty and marked invalid
//! - otherwise the string must be non-empty, of even length, and all hex digits
//! - the decoded length is whatever the string encodes; cipher-specific size
//!   checks happen when a backend is keyed

use crate::error::{EncryptionError, Result};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Placeholder accepted in place of a hex key.
pub const NO_KEY: &str = "-";

/// Raw key bytes for one device.
///
/// Zeroized on drop for security
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The "no key" placeholder.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Decode a key from its table representation.
    ///
    /// # Errors
    /// Returns `InvalidKeyEncoding` for empty, odd-length or non-hex input.
    pub fn from_hex(text: &str) -> Result<Self> {
        if text == NO_KEY {
            return Ok(Self::empty());
        }
        if text.is_empty() {
            return Err(EncryptionError::InvalidKeyEncoding("empty key".into()));
        }
        if text.len() % 2 != 0 {
            return Err(EncryptionError::InvalidKeyEncoding(format!(
                "odd number of hex digits ({})",
                text.len()
            )));
        }

        let bytes = hex::decode(text)
            .map_err(|e| EncryptionError::InvalidKeyEncoding(format!("invalid hex: {e}")))?;
        Ok(Self { bytes })
    }

    /// Table representation: lowercase hex, or `-` when there is no key.
    pub fn to_hex(&self) -> String {
        if self.bytes.is_empty() {
            NO_KEY.to_string()
        } else {
            hex::encode(&self.bytes)
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite every byte with zero, keeping the length.
    ///
    /// The length survives so that a later `key set` can be checked against
    /// the size the device was built with.
    pub fn wipe(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.len() == other.bytes.len() && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl Eq for KeyMaterial {}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
