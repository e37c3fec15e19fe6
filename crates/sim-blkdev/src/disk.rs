//! The simulated disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::backing::{Backing, MEMORY_BACKING};
use crate::error::{BlockDeviceError, Result};
use crate::fault::FaultPlan;
use common::{bytes_to_sectors, Bio, BlockDevice, Direction, IoError, IoStatus, Sector, SECTOR_SIZE};

/// Where a submitted bio completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Inside `submit`, on the caller's thread.
    #[default]
    Inline,
    /// On the disk's own completion thread, after `submit` has returned.
    Threaded,
}

/// Configuration for a simulated disk.
#[derive(Debug, Clone)]
pub struct SimDiskConfig {
    /// Device name used for registry lookup
    pub name: String,
    /// Size in 512-byte sectors
    pub capacity_sectors: u64,
    /// Path to backing file (or ":memory:" for RAM-backed)
    pub backing_path: String,
    pub completion: CompletionMode,
    /// Simulated latency per bio in microseconds
    pub simulated_latency_us: u64,
}

impl Default for SimDiskConfig {
    fn default() -> Self {
        Self {
            name: "sim0".to_string(),
            capacity_sectors: 2048,
            backing_path: MEMORY_BACKING.to_string(),
            completion: CompletionMode::Inline,
            simulated_latency_us: 0,
        }
    }
}

/// Snapshot of the I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub reads: u64,
    pub writes: u64,
    pub sectors_read: u64,
    pub sectors_written: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    sectors_read: AtomicU64,
    sectors_written: AtomicU64,
    errors: AtomicU64,
}

struct DiskInner {
    name: String,
    capacity: u64,
    latency: Option<Duration>,
    backing: Mutex<Backing>,
    faults: FaultPlan,
    counters: Counters,
}

impl DiskInner {
    fn backing(&self) -> MutexGuard<'_, Backing> {
        self.backing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_range(&self, sector: Sector, sectors: u64) -> Result<()> {
        match sector.checked_add(sectors) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(BlockDeviceError::OutOfRange {
                sector,
                sectors,
                capacity: self.capacity,
            }),
        }
    }

    fn execute(&self, bio: &mut Bio) -> IoStatus {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }

        let sector = bio.sector();
        let sectors = bio.sectors();
        let direction = bio.direction();
        if self.check_range(sector, sectors).is_err() {
            return Err(IoError::OutOfRange {
                device: self.name.clone(),
                sector,
                sectors,
                capacity: self.capacity,
            });
        }
        if let Some(reason) = self.faults.check(direction, sector, sectors) {
            return Err(IoError::device(&self.name, sector, reason));
        }

        let mut backing = self.backing();
        let mut cursor = sector;
        let result = match direction {
            Direction::Write => bio.vecs().iter().try_for_each(|vec| {
                backing.write_at(cursor, vec.as_slice())?;
                cursor += bytes_to_sectors(vec.len());
                Ok::<_, BlockDeviceError>(())
            }),
            Direction::Read => bio.vecs_mut().iter_mut().try_for_each(|vec| {
                backing.read_at(cursor, vec.as_mut_slice())?;
                cursor += bytes_to_sectors(vec.len());
                Ok::<_, BlockDeviceError>(())
            }),
        };
        result.map_err(|e| IoError::device(&self.name, sector, e.to_string()))?;

        match direction {
            Direction::Write => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                self.counters.sectors_written.fetch_add(sectors, Ordering::Relaxed);
            }
            Direction::Read => {
                self.counters.reads.fetch_add(1, Ordering::Relaxed);
                self.counters.sectors_read.fetch_add(sectors, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn handle(&self, mut bio: Bio) {
        let status = self.execute(&mut bio);
        match &status {
            Ok(()) => trace!(
                device = %self.name,
                direction = %bio.direction(),
                sector = bio.sector(),
                sectors = bio.sectors(),
                "bio done"
            ),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(device = %self.name, sector = bio.sector(), error = %e, "bio failed");
            }
        }
        bio.complete(status);
    }
}

/// RAM- or file-backed block device with configurable completion context.
pub struct SimDisk {
    inner: Arc<DiskInner>,
    completion: CompletionMode,
    queue: Mutex<Option<Sender<Bio>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimDisk {
    pub fn new(config: SimDiskConfig) -> Result<Self> {
        if config.capacity_sectors == 0 {
            return Err(BlockDeviceError::ZeroCapacity);
        }
        let backing = Backing::open(&config.backing_path, config.capacity_sectors)?;
        let inner = Arc::new(DiskInner {
            name: config.name.clone(),
            capacity: config.capacity_sectors,
            latency: (config.simulated_latency_us > 0)
                .then(|| Duration::from_micros(config.simulated_latency_us)),
            backing: Mutex::new(backing),
            faults: FaultPlan::default(),
            counters: Counters::default(),
        });

        let (queue, worker) = match config.completion {
            CompletionMode::Inline => (None, None),
            CompletionMode::Threaded => {
                let (tx, rx) = mpsc::channel::<Bio>();
                let thread_inner = Arc::clone(&inner);
                let handle = thread::Builder::new()
                    .name(format!("{}-completion", config.name))
                    .spawn(move || {
                        for bio in rx {
                            thread_inner.handle(bio);
                        }
                    })
                    .map_err(BlockDeviceError::Backing)?;
                (Some(tx), Some(handle))
            }
        };

        info!(
            device = %config.name,
            sectors = config.capacity_sectors,
            backing = %config.backing_path,
            completion = ?config.completion,
            "simulated disk ready"
        );
        Ok(Self {
            inner,
            completion: config.completion,
            queue: Mutex::new(queue),
            worker: Mutex::new(worker),
        })
    }

    /// RAM-backed disk completing inline.
    pub fn memory(name: &str, capacity_sectors: u64) -> Result<Self> {
        Self::new(SimDiskConfig {
            name: name.to_string(),
            capacity_sectors,
            ..SimDiskConfig::default()
        })
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.completion
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.inner.faults
    }

    pub fn stats(&self) -> DiskStats {
        let c = &self.inner.counters;
        DiskStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            sectors_read: c.sectors_read.load(Ordering::Relaxed),
            sectors_written: c.sectors_written.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Read raw sectors, bypassing the bio path and fault injection.
    pub fn read_sectors(&self, sector: Sector, count: u64) -> Result<Vec<u8>> {
        self.inner.check_range(sector, count)?;
        let mut buf = vec![0u8; count as usize * SECTOR_SIZE];
        self.inner.backing().read_at(sector, &mut buf)?;
        Ok(buf)
    }

    /// Write raw sectors, bypassing the bio path and fault injection.
    pub fn write_sectors(&self, sector: Sector, data: &[u8]) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(BlockDeviceError::UnalignedBuffer(data.len()));
        }
        self.inner.check_range(sector, bytes_to_sectors(data.len()))?;
        self.inner.backing().write_at(sector, data)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.backing().sync()
    }
}

impl BlockDevice for SimDisk {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn capacity_sectors(&self) -> u64 {
        self.inner.capacity
    }

    fn submit(&self, bio: Bio) {
        match self.completion {
            CompletionMode::Inline => self.inner.handle(bio),
            CompletionMode::Threaded => {
                let queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let rejected = match queue.as_ref() {
                    Some(tx) => tx.send(bio).err().map(|e| e.0),
                    None => Some(bio),
                };
                drop(queue);
                if let Some(bio) = rejected {
                    bio.complete(Err(IoError::NotReady(format!(
                        "{} is shut down",
                        self.inner.name
                    ))));
                }
            }
        }
    }
}

impl Drop for SimDisk {
    fn drop(&mut self) {
        let queue = self
            .queue
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(queue);

        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            // The last handle may be released by a completion callback.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(device = %self.inner.name, "simulated disk closed");
    }
}

impl std::fmt::Debug for SimDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDisk")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}
