//! Shared block I/O vocabulary for the crypt workspace.
//!
//! Everything that crosses a crate boundary lives here: sector arithmetic,
//! the [`Bio`] request descriptor and its [`BioVec`] segments, the
//! [`BlockDevice`] trait implemented by underlying devices, and the
//! [`IoError`] status a request completes with.

pub mod bio;
pub mod error;
pub mod traits;

pub use bio::{Bio, BioVec, Direction, EndIo, PageBuf};
pub use error::{IoError, IoStatus};
pub use traits::{BlockDevice, DeviceRegistry};

/// Sector number on a logical or underlying device.
pub type Sector = u64;

pub const SECTOR_SHIFT: u32 = 9;

/// Addressable unit of every device and the granularity of the IV.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

pub const PAGE_SHIFT: u32 = 12;

/// Size of one data page handed out by the page pool.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of whole sectors covered by `bytes`.
pub fn bytes_to_sectors(bytes: usize) -> u64 {
    (bytes >> SECTOR_SHIFT) as u64
}

/// Byte length of `sectors` sectors.
pub fn sectors_to_bytes(sectors: u64) -> usize {
    (sectors as usize) << SECTOR_SHIFT
}
