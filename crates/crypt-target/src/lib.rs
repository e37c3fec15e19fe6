//! # Crypt Target
//!
//! A logical block device that encrypts every sector on its way to an
//! underlying device and decrypts it on the way back, without changing
//! addressing.
//!
//! ## Request flow
//!
//! ```text
//! caller ──map──► CryptTarget ──► kcryptd worker
//!                                   │ read:  raw read ► device ► decrypt in place
//!                                   │ write: encrypt into pool pages ► clone(s) ► device
//!                                   ▼
//!                              CryptIo::dec_pending ──► caller's end-io (once)
//! ```
//!
//! - **Bounded memory**: control blocks and data pages come from fixed pools;
//!   large writes go out as several clones when pages run short
//! - **Deferred crypto**: conversion never runs in `map` or in a device
//!   completion callback
//! - **One completion per bio**: the first error of any sub-operation wins
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use crypt_target::{CryptTarget, TargetConfig};
//!
//! let target = CryptTarget::new(
//!     &["aes-cbc-essiv:sha256", "00112233445566778899aabbccddeeff", "0", "sim0", "0"],
//!     &devices,
//!     TargetConfig::default(),
//! )?;
//! let (bio, status) = target.map_and_wait(Bio::write(10, segments));
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod io;
pub mod kcryptd;
pub mod mempool;
pub mod table;
pub mod target;

pub use config::TargetConfig;
pub use error::{CryptError, Result};
pub use table::{CipherSpec, CryptTable, IvSpec};
pub use target::{CryptTarget, MapResult, StatusType};

/// Crypt target crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
