//! Crypt work queue.
//!
//! Conversion and submission run here, never on the caller of `map` and
//! never inside a device completion callback. Each queued item waits for a
//! worker permit and then runs on the blocking pool of a runtime owned by the
//! target, so at most `workers` items execute at once.

use std::sync::{Arc, Condvar, Mutex};

use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};

use crate::error::{CryptError, Result};

/// Count of operations started and not yet finished, with a drain wait.
#[derive(Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    pub(crate) fn enter(&self) {
        *self.count.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    pub(crate) fn leave(&self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        let _drained = self
            .drained
            .wait_while(count, |n| *n > 0)
            .unwrap_or_else(|p| p.into_inner());
    }
}

/// Releases the in-flight slot even if the guarded work panics.
pub(crate) struct Leave(pub(crate) Arc<InFlight>);

impl Drop for Leave {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Cloneable handle used to queue work.
#[derive(Clone)]
pub struct KcryptdHandle {
    handle: Handle,
    permits: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
}

impl KcryptdHandle {
    /// Queue `work`; returns immediately.
    pub fn queue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.enter();
        let leave = Leave(Arc::clone(&self.in_flight));
        let permits = Arc::clone(&self.permits);

        self.handle.spawn(async move {
            let _leave = leave;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "crypt worker pool closed, dropping work");
                    return;
                }
            };
            if let Err(e) = spawn_blocking(work).await {
                error!(error = %e, "crypt work item failed");
            }
        });
    }

    /// Wait until everything queued so far, and anything it queued, has run.
    pub fn flush(&self) {
        self.in_flight.wait();
    }
}

/// Owner of the worker runtime.
pub struct Kcryptd {
    runtime: Option<Runtime>,
    handle: KcryptdHandle,
    workers: usize,
}

impl Kcryptd {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = std::cmp::max(1, workers);
        let runtime = RuntimeBuilder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("kcryptd")
            .enable_all()
            .build()
            .map_err(CryptError::Dispatcher)?;

        let handle = KcryptdHandle {
            handle: runtime.handle().clone(),
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(InFlight::default()),
        };
        info!(workers, "kcryptd started");
        Ok(Self {
            runtime: Some(runtime),
            handle,
            workers,
        })
    }

    pub fn handle(&self) -> KcryptdHandle {
        self.handle.clone()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drain the queue and stop the runtime.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.handle.flush();
            self.handle.permits.close();
            runtime.shutdown_background();
            debug!("kcryptd stopped");
        }
    }
}

impl Drop for Kcryptd {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_queue_and_flush() {
        let kcryptd = Kcryptd::new(2).unwrap();
        let handle = kcryptd.handle();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let done = Arc::clone(&done);
            handle.queue(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        handle.flush();
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_flush_covers_follow_up_work() {
        let kcryptd = Kcryptd::new(1).unwrap();
        let handle = kcryptd.handle();
        let done = Arc::new(AtomicUsize::new(0));

        let inner = handle.clone();
        let counter = Arc::clone(&done);
        handle.queue(move || {
            std::thread::sleep(Duration::from_millis(5));
            inner.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        handle.flush();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_limit() {
        let kcryptd = Kcryptd::new(2).unwrap();
        let handle = kcryptd.handle();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handle.queue(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        handle.flush();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_shutdown_drains() {
        let mut kcryptd = Kcryptd::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        kcryptd.handle().queue(move || {
            std::thread::sleep(Duration::from_millis(10));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        kcryptd.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
