//! Sector storage behind a simulated disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use common::{sectors_to_bytes, Sector};

/// Path value selecting RAM-backed storage.
pub const MEMORY_BACKING: &str = ":memory:";

pub(crate) enum Backing {
    Memory(Vec<u8>),
    File(File),
}

impl Backing {
    pub(crate) fn memory(capacity_sectors: u64) -> Self {
        Backing::Memory(vec![0u8; sectors_to_bytes(capacity_sectors)])
    }

    /// Open or create `path`, growing it to the requested capacity.
    pub(crate) fn file<P: AsRef<Path>>(path: P, capacity_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let wanted = sectors_to_bytes(capacity_sectors) as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }
        debug!(path = %path.as_ref().display(), bytes = wanted, "opened file backing");
        Ok(Backing::File(file))
    }

    pub(crate) fn open(path: &str, capacity_sectors: u64) -> Result<Self> {
        if path == MEMORY_BACKING {
            Ok(Self::memory(capacity_sectors))
        } else {
            Self::file(path, capacity_sectors)
        }
    }

    pub(crate) fn read_at(&mut self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        let offset = sectors_to_bytes(sector);
        match self {
            Backing::Memory(data) => {
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.read_exact(buf)?;
            }
        }
        Ok(())
    }

    pub(crate) fn write_at(&mut self, sector: Sector, buf: &[u8]) -> Result<()> {
        let offset = sectors_to_bytes(sector);
        match self {
            Backing::Memory(data) => {
                data[offset..offset + buf.len()].copy_from_slice(buf);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.write_all(buf)?;
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        if let Backing::File(file) = self {
            file.sync_data()?;
        }
        Ok(())
    }
}
