//! Per-sector IV generation
//!
//! The IV of a sector is a pure function of its sector number and the
//! device's configuration, so nothing but the ciphertext ever reaches disk.
//!
//! ## Modes
//!
//! - `plain`: little-endian low 32 bits of the sector, zero padded
//! - `essiv:<hash>`: the sector as little-endian u64, encrypted with the
//!   device cipher keyed by `hash(key)`
//! - `benbi`: big-endian `(sector << shift) + 1` in the last 8 bytes, where the
//!   shift converts 512-byte sectors into cipher blocks (narrow-block counting)
//! - `null`: all zero; only for compatibility with old volumes

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::cipher::{block_cipher_info, new_block_cipher, BlockPrimitive, CipherInfo};
use crate::error::{EncryptionError, Result};
use crate::key::KeyMaterial;
use common::{Sector, SECTOR_SHIFT};

/// Smallest IV buffer handed to a backend; always fits a 64-bit sector.
pub const MIN_IV_SIZE: usize = 8;

/// Hash used to derive the ESSIV salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssivDigest {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl EssivDigest {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sha224" => Ok(EssivDigest::Sha224),
            "sha256" => Ok(EssivDigest::Sha256),
            "sha384" => Ok(EssivDigest::Sha384),
            "sha512" => Ok(EssivDigest::Sha512),
            other => Err(EncryptionError::UnsupportedDigest(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EssivDigest::Sha224 => "sha224",
            EssivDigest::Sha256 => "sha256",
            EssivDigest::Sha384 => "sha384",
            EssivDigest::Sha512 => "sha512",
        }
    }

    pub fn output_size(self) -> usize {
        match self {
            EssivDigest::Sha224 => 28,
            EssivDigest::Sha256 => 32,
            EssivDigest::Sha384 => 48,
            EssivDigest::Sha512 => 64,
        }
    }

    fn salt(self, key: &[u8]) -> Zeroizing<Vec<u8>> {
        let digest = match self {
            EssivDigest::Sha224 => Sha224::digest(key).to_vec(),
            EssivDigest::Sha256 => Sha256::digest(key).to_vec(),
            EssivDigest::Sha384 => Sha384::digest(key).to_vec(),
            EssivDigest::Sha512 => Sha512::digest(key).to_vec(),
        };
        Zeroizing::new(digest)
    }
}

/// IV mode selected on the table line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvMode {
    Plain,
    Essiv(EssivDigest),
    Benbi,
    Null,
}

impl IvMode {
    /// Parse `<mode>` with its optional `:<opts>` suffix already split off.
    ///
    /// Options are only meaningful to `essiv`; other modes ignore them.
    pub fn parse(mode: &str, opts: Option<&str>) -> Result<Self> {
        match mode {
            "plain" => Ok(IvMode::Plain),
            "essiv" => match opts {
                Some(hash) if !hash.is_empty() => Ok(IvMode::Essiv(EssivDigest::parse(hash)?)),
                _ => Err(EncryptionError::MissingEssivDigest),
            },
            "benbi" => Ok(IvMode::Benbi),
            "null" => Ok(IvMode::Null),
            other => Err(EncryptionError::UnsupportedIvMode(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IvMode::Plain => "plain",
            IvMode::Essiv(_) => "essiv",
            IvMode::Benbi => "benbi",
            IvMode::Null => "null",
        }
    }
}

/// Checks that need only names and sizes, never the key.
///
/// Lets a device be configured with a `-` key and still reject combinations
/// that could never work once a key arrives.
pub fn validate(mode: IvMode, cipher: &str, info: &CipherInfo) -> Result<()> {
    let iv_size = info.iv_size.max(MIN_IV_SIZE);
    match mode {
        IvMode::Plain | IvMode::Null => Ok(()),
        IvMode::Benbi => benbi_shift(info.block_size).map(|_| ()),
        IvMode::Essiv(digest) => {
            let (block_size, key_sizes) = block_cipher_info(cipher)?;
            if block_size != iv_size {
                return Err(EncryptionError::EssivBlockSizeMismatch { block_size, iv_size });
            }
            if !key_sizes.contains(&digest.output_size()) {
                return Err(EncryptionError::InvalidKeyLength {
                    cipher: format!("{cipher} (essiv salt from {})", digest.name()),
                    expected: key_sizes.to_vec(),
                    actual: digest.output_size(),
                });
            }
            Ok(())
        }
    }
}

fn benbi_shift(block_size: usize) -> Result<u32> {
    if !block_size.is_power_of_two() {
        return Err(EncryptionError::BlockSizeNotPowerOfTwo(block_size));
    }
    let log = block_size.trailing_zeros();
    if log > SECTOR_SHIFT {
        return Err(EncryptionError::BlockSizeTooLarge(block_size));
    }
    Ok(SECTOR_SHIFT - log)
}

enum IvKind {
    Plain,
    Essiv(Box<dyn BlockPrimitive>),
    Benbi { shift: u32 },
    Null,
}

/// Keyed IV generator for one device.
///
/// Immutable once built and shared by every worker.
pub struct IvGenerator {
    mode: IvMode,
    iv_size: usize,
    kind: IvKind,
}

impl IvGenerator {
    /// Build the generator for `mode` on `cipher`.
    ///
    /// `info` describes the device cipher; the IV buffer is its IV size
    /// raised to [`MIN_IV_SIZE`].
    pub fn new(mode: IvMode, cipher: &str, info: &CipherInfo, key: &KeyMaterial) -> Result<Self> {
        validate(mode, cipher, info)?;
        let iv_size = info.iv_size.max(MIN_IV_SIZE);

        let kind = match mode {
            IvMode::Plain => IvKind::Plain,
            IvMode::Essiv(digest) => {
                let salt = digest.salt(key.as_bytes());
                IvKind::Essiv(new_block_cipher(cipher, &salt)?)
            }
            IvMode::Benbi => {
                let shift = benbi_shift(info.block_size)?;
                IvKind::Benbi { shift }
            }
            IvMode::Null => {
                warn!("null IV mode is cryptographically weak, use only for legacy volumes");
                IvKind::Null
            }
        };

        info!(mode = mode.name(), iv_size, "IV generator ready");
        Ok(Self {
            mode,
            iv_size,
            kind,
        })
    }

    pub fn mode(&self) -> IvMode {
        self.mode
    }

    pub fn iv_size(&self) -> usize {
        self.iv_size
    }

    /// Fill `iv` for `sector`.
    ///
    /// `iv` must be exactly [`Self::iv_size`] bytes.
    pub fn generate(&self, sector: Sector, iv: &mut [u8]) -> Result<()> {
        if iv.len() != self.iv_size {
            return Err(EncryptionError::InvalidIvLength {
                expected: self.iv_size,
                actual: iv.len(),
            });
        }

        iv.fill(0);
        match &self.kind {
            IvKind::Plain => {
                iv[..4].copy_from_slice(&(sector as u32).to_le_bytes());
            }
            IvKind::Essiv(salted) => {
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                salted.encrypt_one(iv);
            }
            IvKind::Benbi { shift } => {
                let value = (sector << shift).wrapping_add(1);
                let tail = self.iv_size - 8;
                iv[tail..].copy_from_slice(&value.to_be_bytes());
            }
            IvKind::Null => {}
        }
        Ok(())
    }

    /// Convenience wrapper returning a fresh buffer.
    pub fn iv_for(&self, sector: Sector) -> Result<Vec<u8>> {
        let mut iv = vec![0u8; self.iv_size];
        self.generate(sector, &mut iv)?;
        Ok(iv)
    }
}

impl std::fmt::Debug for IvGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvGenerator")
            .field("mode", &self.mode)
            .field("iv_size", &self.iv_size)
            .finish_non_exhaustive()
    }
}
