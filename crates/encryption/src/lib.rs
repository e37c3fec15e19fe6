//! # Sector Encryption
//!
//! Cipher, key and IV building blocks for the transparent crypt target.
//!
//! ## Features
//!
//! - **Pluggable backends**: [`CipherBackend`] trait with a RustCrypto
//!   implementation for AES (ECB/CBC/XTS), DES and 3DES-EDE
//! - **Per-sector IVs**: `plain`, `essiv:<hash>`, `benbi` and `null`
//! - **Fragment-aware conversion**: [`Converter`] walks unaligned input and
//!   output segment lists one sector at a time
//! - **Key hygiene**: [`KeyMaterial`] zeroizes on drop and redacts `Debug`
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use encryption::{cipher_info, ChainMode, Converter, ConvertContext, IvGenerator, IvMode,
//!                  KeyMaterial, SoftwareCipher};
//!
//! let key = KeyMaterial::from_hex("00112233445566778899aabbccddeeff")?;
//! let info = cipher_info("aes", ChainMode::Cbc)?;
//! let backend = Arc::new(SoftwareCipher::new("aes", ChainMode::Cbc, &key)?);
//! let iv = IvGenerator::new(IvMode::parse("essiv", Some("sha256"))?, "aes", &info, &key)?;
//!
//! let converter = Converter::new(backend, Some(iv));
//! let mut ctx = ConvertContext::new(Direction::Write, sector, iv_offset);
//! converter.convert(&mut ctx, &plain_segments, &mut clone_segments)?;
//! ```
//!
//! ```text
//! crypt-target (request lifecycle)
//!     ↓ (uses)
//! encryption crate
//!     ↓ (provides)
//! - Converter + ConvertContext
//! - IV generators
//! - Cipher backends
//! - Key material
//! ```

pub mod cipher;
pub mod convert;
pub mod error;
pub mod iv;
pub mod key;

pub use cipher::{
    block_cipher_info, cipher_info, new_block_cipher, BackendFactory, BlockPrimitive,
    ChainMode, CipherBackend, CipherInfo, SoftwareBackendFactory, SoftwareCipher,
};
pub use convert::{ConvertContext, Converter};
pub use error::{EncryptionError, Result};
pub use iv::{EssivDigest, IvGenerator, IvMode, MIN_IV_SIZE};
pub use key::{KeyMaterial, NO_KEY};

/// Encryption crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
