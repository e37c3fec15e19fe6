//! Page-backed buffers for write clones and staged segments.

use std::time::Duration;

use tracing::{debug, trace};

use crate::mempool::{Mempool, Pooled};
use common::{Bio, BioVec, IoError, PAGE_SIZE};

/// Page allocations per clone that wait for the pool.
///
/// Beyond this a clone takes only pages that are free right away and is cut
/// short otherwise.
pub const MIN_BIO_PAGES: usize = 8;

/// One data page on loan from the page pool.
pub type Page = Pooled<Vec<u8>>;

/// Pool of `PAGE_SIZE` data pages.
pub type PagePool = Mempool<Vec<u8>>;

pub fn page_pool(pages: usize) -> PagePool {
    Mempool::new("pages", pages, || vec![0u8; PAGE_SIZE])
}

/// Segment list of up to `size` bytes built from pool pages.
///
/// The first [`MIN_BIO_PAGES`] pages, capped at the pool capacity, block until
/// in-flight clones hand pages back; later pages are taken only if free. The
/// result may cover less than `size` but never more, and is `None` only for an
/// empty request. `size` must be a multiple of the sector size.
pub fn alloc_clone_buffer(pool: &PagePool, size: usize) -> Option<Vec<BioVec>> {
    let nr_pages = size.div_ceil(PAGE_SIZE);
    let blocking = MIN_BIO_PAGES.min(pool.capacity());
    let mut vecs = Vec::with_capacity(nr_pages);
    let mut remaining = size;

    for i in 0..nr_pages {
        let page = if i < blocking {
            Some(pool.alloc())
        } else {
            pool.try_alloc()
        };
        let Some(page) = page else {
            break;
        };

        let len = remaining.min(PAGE_SIZE);
        match BioVec::new(page, 0, len) {
            Ok(vec) => vecs.push(vec),
            Err(_) => break,
        }
        remaining -= len;
    }

    if vecs.is_empty() {
        debug!(requested = size, "no pages for clone");
        return None;
    }
    if remaining > 0 {
        trace!(requested = size, got = size - remaining, "partial clone");
    }
    Some(vecs)
}

/// Pool pages standing in for one caller segment.
#[derive(Debug)]
struct StagedSegment {
    original: BioVec,
    first: usize,
    count: usize,
}

/// Caller segments swapped out for pool pages while a request is in flight.
#[derive(Debug, Default)]
pub struct Staging {
    entries: Vec<StagedSegment>,
}

impl Staging {
    /// Replace every staged segment of `bio` with pool pages.
    ///
    /// For writes the caller's data is copied into the pages. All pages are
    /// obtained before the bio is touched, so on failure `bio` is unchanged
    /// and the pages already taken go straight back to the pool.
    pub fn acquire(pool: &PagePool, bio: &mut Bio, wait: Duration) -> Result<Self, IoError> {
        let mut replacements: Vec<(usize, Vec<BioVec>)> = Vec::new();
        for (index, vec) in bio.vecs().iter().enumerate() {
            if !vec.is_staged() {
                continue;
            }
            let mut pages = Vec::new();
            let mut remaining = vec.len();
            while remaining > 0 {
                let page: Page = pool
                    .alloc_timeout(wait)
                    .ok_or_else(|| IoError::exhausted("staging pages"))?;
                let len = remaining.min(PAGE_SIZE);
                pages.push(BioVec::new(page, 0, len)?);
                remaining -= len;
            }
            replacements.push((index, pages));
        }

        if replacements.is_empty() {
            return Ok(Self::default());
        }

        let copy_in = bio.direction().is_write();
        let originals = bio.take_vecs();
        let mut replacements = replacements.into_iter().peekable();
        let mut vecs = Vec::with_capacity(originals.len());
        let mut entries = Vec::new();

        for (index, original) in originals.into_iter().enumerate() {
            match replacements.next_if(|(i, _)| *i == index) {
                Some((_, mut pages)) => {
                    if copy_in {
                        let mut cursor = 0;
                        for page in &mut pages {
                            let len = page.len();
                            page.as_mut_slice()
                                .copy_from_slice(&original.as_slice()[cursor..cursor + len]);
                            cursor += len;
                        }
                    }
                    entries.push(StagedSegment {
                        original,
                        first: vecs.len(),
                        count: pages.len(),
                    });
                    vecs.extend(pages);
                }
                None => vecs.push(original),
            }
        }

        debug!(segments = entries.len(), "staged segments");
        bio.set_vecs(vecs);
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Put the caller's segments back, copying page contents into them first
    /// when `copy_back` is set. The pages return to the pool.
    pub fn release(self, bio: &mut Bio, copy_back: bool) {
        if self.entries.is_empty() {
            return;
        }

        let current = bio.take_vecs();
        let mut restored = Vec::with_capacity(current.len());
        let mut current = current.into_iter().enumerate().peekable();
        let mut entries = self.entries.into_iter().peekable();

        while let Some((position, vec)) = current.next() {
            match entries.next_if(|entry| entry.first == position) {
                Some(mut entry) => {
                    let mut pages = vec![vec];
                    for _ in 1..entry.count {
                        if let Some((_, page)) = current.next() {
                            pages.push(page);
                        }
                    }
                    if copy_back {
                        let mut cursor = 0;
                        let dst = entry.original.as_mut_slice();
                        for page in &pages {
                            let len = page.len();
                            dst[cursor..cursor + len].copy_from_slice(page.as_slice());
                            cursor += len;
                        }
                    }
                    restored.push(entry.original);
                }
                None => restored.push(vec),
            }
        }

        bio.set_vecs(restored);
    }
}
