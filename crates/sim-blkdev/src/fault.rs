//! Fault injection hooks for resilience tests.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use common::{Direction, Sector};

/// Which bios the disk fails on purpose.
#[derive(Default)]
pub struct FaultPlan {
    fail_next: AtomicU64,
    bad_ranges: Mutex<Vec<Range<Sector>>>,
}

impl FaultPlan {
    /// Fail the next `count` bios regardless of where they land.
    pub fn fail_next(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every bio that touches a sector in `range`.
    pub fn fail_range(&self, range: Range<Sector>) {
        self.bad_ranges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(range);
    }

    pub fn clear(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.bad_ranges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Reason to fail this bio, if any.
    pub(crate) fn check(&self, direction: Direction, sector: Sector, sectors: u64) -> Option<String> {
        let armed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Some(format!("injected {direction} failure"));
        }

        let end = sector.saturating_add(sectors);
        let ranges = self
            .bad_ranges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ranges
            .iter()
            .find(|bad| bad.start < end && sector < bad.end)
            .map(|bad| format!("injected medium error in sectors {}..{}", bad.start, bad.end))
    }
}

impl std::fmt::Debug for FaultPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultPlan")
            .field("fail_next", &self.fail_next.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
