//! Block I/O request descriptors.
//!
//! A [`Bio`] is a transfer of whole sectors starting at one sector of a
//! device. Its payload is a list of [`BioVec`] segments, each a window into
//! some buffer the bio owns for the duration of the transfer. Ownership of the
//! whole bio, buffers included, moves to the device on submit and comes back
//! through the end-io callback, so nobody can touch the memory while the
//! device is working on it.

use std::fmt;

use crate::error::{IoError, IoStatus};
use crate::{bytes_to_sectors, Sector, SECTOR_SIZE};

/// Memory a segment can point into.
///
/// Implemented for anything that exposes a mutable byte slice: `Vec<u8>`,
/// `Box<[u8]>`, pooled pages.
pub trait PageBuf: AsRef<[u8]> + AsMut<[u8]> + Send + 'static {}

impl<T> PageBuf for T where T: AsRef<[u8]> + AsMut<[u8]> + Send + 'static {}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn is_write(self) -> bool {
        matches!(self, Direction::Write)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// One contiguous segment of a bio.
///
/// The segment covers `len` bytes of `buf` starting at `offset`; `len` is
/// always a non-zero multiple of [`SECTOR_SIZE`].
pub struct BioVec {
    buf: Box<dyn PageBuf>,
    offset: usize,
    len: usize,
    staged: bool,
}

impl BioVec {
    /// Wrap a window of `buf`.
    pub fn new<B: PageBuf>(buf: B, offset: usize, len: usize) -> Result<Self, IoError> {
        let capacity = buf.as_ref().len();
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(IoError::invalid(format!(
                "segment length {len} is not a positive multiple of {SECTOR_SIZE}"
            )));
        }
        match offset.checked_add(len) {
            Some(end) if end <= capacity => {}
            _ => {
                return Err(IoError::invalid(format!(
                    "segment {offset}+{len} exceeds buffer of {capacity} bytes"
                )))
            }
        }

        Ok(Self {
            buf: Box::new(buf),
            offset,
            len,
            staged: false,
        })
    }

    /// Segment covering a whole vector.
    pub fn from_vec(data: Vec<u8>) -> Result<Self, IoError> {
        let len = data.len();
        Self::new(data, 0, len)
    }

    /// Zero-filled segment of `len` bytes.
    pub fn zeroed(len: usize) -> Result<Self, IoError> {
        Self::from_vec(vec![0u8; len])
    }

    /// Mark this segment as memory the cipher path may not address directly.
    ///
    /// Staged segments are swapped for pool pages before conversion and
    /// copied back on read completion.
    pub fn staged(mut self) -> Self {
        self.staged = true;
        self
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_slice(&self) -> &[u8] {
        let buf: &[u8] = (*self.buf).as_ref();
        &buf[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        let buf: &mut [u8] = (*self.buf).as_mut();
        &mut buf[offset..offset + len]
    }

    /// Give the backing buffer back to the owner.
    pub fn into_buf(self) -> Box<dyn PageBuf> {
        self.buf
    }
}

impl fmt::Debug for BioVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BioVec")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("staged", &self.staged)
            .finish()
    }
}

/// Completion callback; receives the bio back together with its status.
pub type EndIo = Box<dyn FnOnce(Bio, IoStatus) + Send + 'static>;

/// A block I/O request.
pub struct Bio {
    sector: Sector,
    direction: Direction,
    vecs: Vec<BioVec>,
    end_io: Option<EndIo>,
}

impl Bio {
    pub fn new(direction: Direction, sector: Sector, vecs: Vec<BioVec>) -> Self {
        Self {
            sector,
            direction,
            vecs,
            end_io: None,
        }
    }

    pub fn read(sector: Sector, vecs: Vec<BioVec>) -> Self {
        Self::new(Direction::Read, sector, vecs)
    }

    pub fn write(sector: Sector, vecs: Vec<BioVec>) -> Self {
        Self::new(Direction::Write, sector, vecs)
    }

    /// Install the completion callback.
    pub fn with_end_io<F>(mut self, end_io: F) -> Self
    where
        F: FnOnce(Bio, IoStatus) + Send + 'static,
    {
        self.end_io = Some(Box::new(end_io));
        self
    }

    pub fn set_end_io(&mut self, end_io: EndIo) {
        self.end_io = Some(end_io);
    }

    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn set_sector(&mut self, sector: Sector) {
        self.sector = sector;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Total payload in bytes.
    pub fn size(&self) -> usize {
        self.vecs.iter().map(BioVec::len).sum()
    }

    /// Total payload in sectors.
    pub fn sectors(&self) -> u64 {
        bytes_to_sectors(self.size())
    }

    pub fn vecs(&self) -> &[BioVec] {
        &self.vecs
    }

    pub fn vecs_mut(&mut self) -> &mut [BioVec] {
        &mut self.vecs
    }

    pub fn vec_count(&self) -> usize {
        self.vecs.len()
    }

    /// Detach the segment list, leaving the bio empty.
    pub fn take_vecs(&mut self) -> Vec<BioVec> {
        std::mem::take(&mut self.vecs)
    }

    pub fn set_vecs(&mut self, vecs: Vec<BioVec>) {
        self.vecs = vecs;
    }

    pub fn push_vec(&mut self, vec: BioVec) {
        self.vecs.push(vec);
    }

    /// Concatenated payload.
    pub fn copy_out(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for vec in &self.vecs {
            out.extend_from_slice(vec.as_slice());
        }
        out
    }

    /// Fill the payload from `data`, segment by segment.
    pub fn copy_in(&mut self, data: &[u8]) -> Result<(), IoError> {
        if data.len() != self.size() {
            return Err(IoError::invalid(format!(
                "payload of {} bytes does not match bio of {} bytes",
                data.len(),
                self.size()
            )));
        }
        let mut cursor = 0;
        for vec in &mut self.vecs {
            let len = vec.len();
            vec.as_mut_slice().copy_from_slice(&data[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    /// Signal completion. Runs the end-io callback, if any, exactly once.
    pub fn complete(mut self, status: IoStatus) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self, status);
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("size", &self.size())
            .field("vecs", &self.vecs.len())
            .field("end_io", &self.end_io.is_some())
            .finish()
    }
}
