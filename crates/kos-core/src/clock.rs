//! Kernel clock
//!
//! Every subsystem reads time from a shared `Clock` instead of calling
//! `Instant::now()` directly. The clock has two sources:
//!
//! - `system` - monotonic wall time since clock creation
//! - `manual` - a counter advanced explicitly, used by tests to expire
//!   ARP entries, TCP timers, DHCP leases and the like without sleeping
//!
//! All timestamps are `Duration`s since clock creation, so subsystems can
//! store and compare them without caring which source is behind the clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

enum ClockSource {
    /// Monotonic time relative to clock creation
    System { start: Instant },

    /// Explicitly advanced counter, nanoseconds
    Manual { now_ns: AtomicU64 },
}

/// Shared time source for the kernel
pub struct Clock {
    source: ClockSource,
}

impl Clock {
    /// Create a clock backed by monotonic wall time
    pub fn system() -> Self {
        Clock {
            source: ClockSource::System { start: Instant::now() },
        }
    }

    /// Create a manually advanced clock starting at zero
    pub fn manual() -> Self {
        Clock {
            source: ClockSource::Manual { now_ns: AtomicU64::new(0) },
        }
    }

    /// Current time since clock creation
    pub fn now(&self) -> Duration {
        match &self.source {
            ClockSource::System { start } => start.elapsed(),
            ClockSource::Manual { now_ns } => {
                Duration::from_nanos(now_ns.load(Ordering::Acquire))
            }
        }
    }

    /// Current time in whole milliseconds
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }

    /// Advance a manual clock
    ///
    /// No effect on a system clock; the caller is driving simulated time
    /// and a system clock advances on its own.
    pub fn advance(&self, delta: Duration) {
        if let ClockSource::Manual { now_ns } = &self.source {
            now_ns.fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
        } else {
            log::warn!("Clock::advance called on a system clock, ignored");
        }
    }

    /// True if this clock only moves when `advance` is called
    pub fn is_manual(&self) -> bool {
        matches!(self.source, ClockSource::Manual { .. })
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}
