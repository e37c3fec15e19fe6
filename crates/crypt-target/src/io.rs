//! Pending-request lifecycle.
//!
//! Every bio accepted by the target gets one [`CryptIo`]. It counts the
//! sub-operations still outstanding for the bio (the raw read, the decrypt
//! pass, each write clone), keeps the first error any of them reports, and
//! completes the caller's bio exactly once when the count drops to zero.
//!
//! ```text
//! map ──► kcryptd ──► process_read ──► device ──► read_endio ──► kcryptd ──► decrypt ─┐
//!                 └─► process_write ──► clone 1..n ──► device ──► write_endio ───────┤
//!                                                                                    ▼
//!                                                                              dec_pending
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;

use tracing::{debug, error, instrument, trace, warn};

use crate::buffer::{alloc_clone_buffer, Staging};
use crate::kcryptd::Leave;
use crate::mempool::Pooled;
use crate::target::TargetCore;
use common::{bytes_to_sectors, Bio, Direction, IoError, IoStatus, Sector};
use encryption::{ConvertContext, Converter};

/// Pool entry backing one pending request.
#[derive(Debug)]
pub struct IoSlot {
    id: u64,
}

impl IoSlot {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outstanding-operation count with a sticky first error.
///
/// Starts at zero. `inc` must happen before the matching operation is handed
/// to anyone who might complete it.
#[derive(Debug, Default)]
pub struct PendingCount {
    pending: AtomicUsize,
    error: OnceLock<IoError>,
}

impl PendingCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one completion.
    ///
    /// Returns the aggregated status to the single caller whose decrement
    /// reached zero, and `None` to everyone else.
    pub fn dec(&self, status: IoStatus) -> Option<IoStatus> {
        if let Err(e) = status {
            if self.error.set(e).is_err() {
                trace!("later error dropped, first error kept");
            }
        }

        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pending count underflow");
        if previous != 1 {
            return None;
        }

        match self.error.get() {
            Some(e) => Some(Err(e.clone())),
            None => Some(Ok(())),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// One accepted bio on its way through the target.
pub struct CryptIo {
    core: Arc<TargetCore>,
    converter: Option<Arc<Converter>>,
    id: u64,
    direction: Direction,
    sector: Sector,
    base: Mutex<Option<Bio>>,
    staging: Mutex<Option<Staging>>,
    count: PendingCount,
    post_process: AtomicBool,
    slot: Mutex<Option<Pooled<IoSlot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CryptIo {
    pub(crate) fn new(
        core: Arc<TargetCore>,
        converter: Option<Arc<Converter>>,
        bio: Bio,
        slot: Pooled<IoSlot>,
    ) -> Self {
        Self {
            core,
            converter,
            id: slot.id(),
            direction: bio.direction(),
            sector: bio.sector(),
            base: Mutex::new(Some(bio)),
            staging: Mutex::new(None),
            count: PendingCount::new(),
            post_process: AtomicBool::new(false),
            slot: Mutex::new(Some(slot)),
        }
    }

    /// Work item body: start the request or finish a completed read.
    pub(crate) fn process(self: Arc<Self>) {
        if self.post_process.load(Ordering::Acquire) {
            self.process_read_endio();
            return;
        }

        if let Err(e) = self.prepare() {
            self.count.inc();
            self.dec_pending(Err(e));
            return;
        }
        match self.direction {
            Direction::Read => self.process_read(),
            Direction::Write => self.process_write(),
        }
    }

    /// Checks and staging done once before any I/O is issued.
    fn prepare(&self) -> IoStatus {
        if self.converter.is_none() {
            return Err(IoError::NotReady("crypt key is not set".into()));
        }

        let mut base = lock(&self.base);
        let Some(bio) = base.as_mut() else {
            return Err(IoError::invalid("request already completed"));
        };

        let sectors = bio.sectors();
        let len = self.core.len_sectors();
        if bio.sector().checked_add(sectors).map_or(true, |end| end > len) {
            return Err(IoError::OutOfRange {
                device: self.core.name().to_string(),
                sector: bio.sector(),
                sectors,
                capacity: len,
            });
        }

        if bio.vecs().iter().any(|v| v.is_staged()) {
            let staging = Staging::acquire(
                &self.core.staging_pool,
                bio,
                self.core.config.alloc_timeout(),
            )?;
            *lock(&self.staging) = Some(staging);
        }
        Ok(())
    }

    /// Issue one raw read straight into the caller's buffers.
    #[instrument(level = "debug", skip(self), fields(io = self.id, sector = self.sector))]
    fn process_read(self: Arc<Self>) {
        self.count.inc();

        let (vecs, sector) = {
            let mut base = lock(&self.base);
            match base.as_mut() {
                Some(bio) => (bio.take_vecs(), bio.sector()),
                None => return,
            }
        };

        let io = Arc::clone(&self);
        let clone = Bio::read(self.core.start + sector, vecs)
            .with_end_io(move |clone, status| io.read_endio(clone, status));
        trace!(device_sector = self.core.start + sector, "raw read issued");
        self.core.device.submit(clone);
    }

    /// Device completion of the raw read; only bookkeeping happens here.
    fn read_endio(self: Arc<Self>, mut clone: Bio, status: IoStatus) {
        if let Some(bio) = lock(&self.base).as_mut() {
            bio.set_vecs(clone.take_vecs());
        }

        if let Err(e) = status {
            self.dec_pending(Err(e));
            return;
        }

        self.post_process.store(true, Ordering::Release);
        let io = Arc::clone(&self);
        self.core.kcryptd.queue(move || io.process());
    }

    /// Decrypt the read data in place and drop the read's reference.
    #[instrument(level = "debug", skip(self), fields(io = self.id, sector = self.sector))]
    fn process_read_endio(&self) {
        let result = match (&self.converter, lock(&self.base).as_mut()) {
            (Some(converter), Some(bio)) => {
                let mut ctx = ConvertContext::new(Direction::Read, bio.sector(), self.core.iv_offset);
                converter
                    .convert_in_place(&mut ctx, bio.vecs_mut())
                    .map(|_| ())
                    .map_err(|e| IoError::cipher(e.to_string()))
            }
            _ => Err(IoError::NotReady("crypt key is not set".into())),
        };

        if let Err(e) = &result {
            warn!(io = self.id, error = %e, "decryption failed");
        }
        self.dec_pending(result);
    }

    /// Encrypt into clones built from pool pages and submit them.
    ///
    /// Clones that were already submitted when a later one fails stay on the
    /// device; the request still completes with the error.
    #[instrument(level = "debug", skip(self), fields(io = self.id, sector = self.sector))]
    fn process_write(self: Arc<Self>) {
        let Some(converter) = self.converter.clone() else {
            return;
        };
        let Some(base) = lock(&self.base).take() else {
            return;
        };
        self.count.inc();

        let mut ctx = ConvertContext::new(Direction::Write, base.sector(), self.core.iv_offset);
        let mut remaining = base.size();
        let mut sector = base.sector();

        while remaining > 0 {
            let clone_vecs = {
                let _serial = lock(&self.core.alloc_lock);
                alloc_clone_buffer(&self.core.page_pool, remaining)
            };
            let Some(mut out) = clone_vecs else {
                self.restore_base(base);
                self.dec_pending(Err(IoError::exhausted("no pages for write clone")));
                return;
            };

            if let Err(e) = converter.convert(&mut ctx, base.vecs(), &mut out) {
                drop(out);
                warn!(io = self.id, error = %e, "encryption failed");
                self.restore_base(base);
                self.dec_pending(Err(IoError::cipher(e.to_string())));
                return;
            }

            let clone_size: usize = out.iter().map(|v| v.len()).sum();
            let device_sector = self.core.start + sector;
            let io = Arc::clone(&self);
            let clone = Bio::write(device_sector, out).with_end_io(move |clone, status| {
                drop(clone);
                io.dec_pending(status);
            });

            remaining -= clone_size;
            sector += bytes_to_sectors(clone_size);
            trace!(device_sector, bytes = clone_size, remaining, "write clone issued");

            if remaining == 0 {
                self.restore_base(base);
                self.core.device.submit(clone);
                return;
            }

            // Keep the request alive across this submit.
            self.count.inc();
            self.core.device.submit(clone);
            thread::sleep(self.core.config.congestion_backoff());
        }

        // Empty write: nothing to submit.
        self.restore_base(base);
        self.dec_pending(Ok(()));
    }

    fn restore_base(&self, bio: Bio) {
        *lock(&self.base) = Some(bio);
    }

    /// Drop one reference; the last one completes the caller's bio.
    pub(crate) fn dec_pending(&self, status: IoStatus) {
        if let Some(status) = self.count.dec(status) {
            self.finish(status);
        }
    }

    fn finish(&self, status: IoStatus) {
        let Some(mut bio) = lock(&self.base).take() else {
            error!(io = self.id, "pending request finished twice");
            return;
        };

        if let Some(staging) = lock(&self.staging).take() {
            staging.release(&mut bio, self.direction == Direction::Read);
        }

        match &status {
            Ok(()) => debug!(
                io = self.id,
                direction = %self.direction,
                sector = self.sector,
                sectors = bio.sectors(),
                "request complete"
            ),
            Err(e) => error!(
                io = self.id,
                direction = %self.direction,
                sector = self.sector,
                error = %e,
                "request failed"
            ),
        }

        // The control block goes back before the caller can observe completion.
        self.core.completing.enter();
        let _completing = Leave(Arc::clone(&self.core.completing));
        let slot = lock(&self.slot).take();
        drop(slot);
        bio.complete(status);
    }
}

impl std::fmt::Debug for CryptIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptIo")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("pending", &self.count.pending())
            .field("post_process", &self.post_process.load(Ordering::Relaxed))
            .finish()
    }
}
