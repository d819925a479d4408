// Author: Lukas Bower
// Purpose: Per-queue-set maintenance tick bookkeeping.

//! Periodic maintenance for a queue set.

use portable_atomic::{AtomicU64, Ordering};

/// What one maintenance tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerReport {
    /// Send descriptors reclaimed across all queues.
    pub reclaimed: u32,
    /// Receive buffers posted to short free lists.
    pub refilled: u32,
    /// Hardware reported the response queue starved and a credit was returned.
    pub starved: bool,
    /// Records found by the re-poll.
    pub repolled: usize,
    /// Pending requests replayed by restarts.
    pub restarted: usize,
}

/// Periodic tick owned by one queue set. The caller supplies the clock.
#[derive(Debug)]
pub struct MaintenanceTimer {
    period_ms: u64,
    next_due_ms: AtomicU64,
}

impl MaintenanceTimer {
    /// Creates a timer whose first tick is due immediately.
    #[must_use]
    pub const fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            next_due_ms: AtomicU64::new(0),
        }
    }

    /// Tick period.
    #[must_use]
    pub const fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Claims the tick at `now_ms`. Only one caller wins a given period.
    pub fn claim(&self, now_ms: u64) -> bool {
        let due = self.next_due_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        self.next_due_ms
            .compare_exchange(
                due,
                now_ms.saturating_add(self.period_ms),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
