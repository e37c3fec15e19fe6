//! Bounded object pools.
//!
//! A [`Mempool`] is filled once at construction and never grows, so the
//! number of outstanding objects can never exceed its capacity. Objects come
//! back automatically when the [`Pooled`] guard is dropped, which wakes any
//! thread blocked in an allocation.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

struct PoolState<T> {
    free: Vec<T>,
    outstanding: usize,
}

struct Shared<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<PoolState<T>>,
    changed: Condvar,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, item: T) {
        let mut state = self.state();
        state.free.push(item);
        state.outstanding -= 1;
        drop(state);
        self.changed.notify_all();
    }
}

/// Fixed-capacity pool of reusable objects.
pub struct Mempool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Mempool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Mempool<T> {
    /// Pool of `capacity` objects built up front by `make`.
    pub fn new(name: &'static str, capacity: usize, mut make: impl FnMut() -> T) -> Self {
        let free = (0..capacity).map(|_| make()).collect();
        Self {
            shared: Arc::new(Shared {
                name,
                capacity,
                state: Mutex::new(PoolState {
                    free,
                    outstanding: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn take(&self, state: &mut PoolState<T>) -> Option<Pooled<T>> {
        let item = state.free.pop()?;
        state.outstanding += 1;
        Some(Pooled {
            item: Some(item),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Take an object if one is free right now.
    pub fn try_alloc(&self) -> Option<Pooled<T>> {
        let mut state = self.shared.state();
        self.take(&mut state)
    }

    /// Wait as long as it takes for an object.
    pub fn alloc(&self) -> Pooled<T> {
        let mut state = self.shared.state();
        loop {
            if let Some(item) = self.take(&mut state) {
                return item;
            }
            trace!(pool = self.shared.name, "waiting for free object");
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Wait at most `timeout` for an object.
    pub fn alloc_timeout(&self, timeout: Duration) -> Option<Pooled<T>> {
        let state = self.shared.state();
        let (mut state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.free.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.take(&mut state)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        self.shared.state().free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.state().outstanding
    }

    /// Block until every object is back, or `timeout` passes.
    ///
    /// Returns `true` when the pool is idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let state = self.shared.state();
        match timeout {
            None => {
                let _idle = self
                    .shared
                    .changed
                    .wait_while(state, |s| s.outstanding > 0)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                true
            }
            Some(timeout) => {
                let (state, _) = self
                    .shared
                    .changed
                    .wait_timeout_while(state, timeout, |s| s.outstanding > 0)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.outstanding == 0
            }
        }
    }
}

impl<T> std::fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Mempool")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

/// An object on loan from a [`Mempool`].
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<Shared<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` empties the slot.
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Pooled<T> {
    fn as_ref(&self) -> &[u8] {
        (**self).as_ref()
    }
}

impl<T: AsMut<[u8]>> AsMut<[u8]> for Pooled<T> {
    fn as_mut(&mut self) -> &mut [u8] {
        (**self).as_mut()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}
