//! Background timer worker
//!
//! A single thread that periodically runs every registered sweep: TCP
//! retransmission and TIME_WAIT timers, connection-tracking ageing, ARP
//! expiration, reassembly timeouts, DNS cache cleanup, DHCP state
//! advancement.
//!
//! # Design
//!
//! The worker:
//! 1. Reads the kernel clock
//! 2. Calls `sweep(now)` on each registered `TimerSweep` in order
//! 3. Sleeps for the configured interval
//!
//! Sweeps never block and take their own locks internally, so the worker
//! holds no lock across a sweep boundary. Tests call `run_sweeps` directly
//! against a manual clock instead of spawning the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::Clock;

/// A periodic maintenance pass owned by some subsystem
pub trait TimerSweep: Send + Sync {
    /// Short name for logs and stats
    fn name(&self) -> &'static str;

    /// Run one maintenance pass at kernel time `now`
    fn sweep(&self, now: Duration);
}

/// Configuration for the timer worker thread
#[derive(Debug, Clone)]
pub struct TimerWorkerConfig {
    /// Time between sweep rounds (default: 50ms, must stay <= 100ms)
    pub interval: Duration,

    /// Thread name
    pub thread_name: String,
}

impl Default for TimerWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            thread_name: "kos-timer".into(),
        }
    }
}

impl TimerWorkerConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.interval.is_zero() {
            return Err("interval must be non-zero");
        }
        if self.interval > Duration::from_millis(100) {
            return Err("interval must not exceed 100ms");
        }
        Ok(())
    }
}

/// Statistics from timer worker execution
#[derive(Debug, Clone, Default)]
pub struct TimerWorkerStats {
    /// Total sweep rounds executed
    pub rounds: u64,

    /// Total individual sweeps executed
    pub sweeps: u64,
}

/// Handle to the running timer worker
pub struct TimerWorker {
    handle: Option<JoinHandle<TimerWorkerStats>>,
    shutdown: Arc<AtomicBool>,
}

impl TimerWorker {
    /// Spawn the worker thread over the given sweeps
    pub fn spawn(
        clock: Arc<Clock>,
        sweeps: Vec<Arc<dyn TimerSweep>>,
        config: TimerWorkerConfig,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || timer_loop(clock, sweeps, shutdown_clone, config))
            .expect("failed to spawn timer worker");

        TimerWorker {
            handle: Some(handle),
            shutdown,
        }
    }

    /// Request shutdown without waiting
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Request shutdown and join the worker
    pub fn shutdown(mut self) -> TimerWorkerStats {
        self.shutdown.store(true, Ordering::Release);
        self.handle
            .take()
            .expect("handle already taken")
            .join()
            .expect("timer worker panicked")
    }
}

impl Drop for TimerWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Run one sweep round outside the worker thread
///
/// This is the loop body; tests drive it directly with a manual clock.
pub fn run_sweeps(clock: &Clock, sweeps: &[Arc<dyn TimerSweep>]) {
    let now = clock.now();
    for sweep in sweeps {
        sweep.sweep(now);
    }
}

fn timer_loop(
    clock: Arc<Clock>,
    sweeps: Vec<Arc<dyn TimerSweep>>,
    shutdown: Arc<AtomicBool>,
    config: TimerWorkerConfig,
) -> TimerWorkerStats {
    let mut stats = TimerWorkerStats::default();
    log::debug!("timer worker started, {} sweeps registered", sweeps.len());

    while !shutdown.load(Ordering::Acquire) {
        run_sweeps(&clock, &sweeps);
        stats.rounds += 1;
        stats.sweeps += sweeps.len() as u64;
        thread::sleep(config.interval);
    }

    log::debug!("timer worker stopped after {} rounds", stats.rounds);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingSweep {
        calls: AtomicU64,
        last_now_ms: AtomicU64,
    }

    impl CountingSweep {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                last_now_ms: AtomicU64::new(0),
            }
        }
    }

    impl TimerSweep for CountingSweep {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sweep(&self, now: Duration) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_now_ms.store(now.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_sweeps_manual_clock() {
        let clock = Clock::manual();
        let sweep = Arc::new(CountingSweep::new());
        let sweeps: Vec<Arc<dyn TimerSweep>> = vec![sweep.clone()];

        clock.advance(Duration::from_millis(120));
        run_sweeps(&clock, &sweeps);

        assert_eq!(sweep.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sweep.last_now_ms.load(Ordering::SeqCst), 120);
    }

    #[test]
    fn test_worker_thread_runs_and_stops() {
        let clock = Arc::new(Clock::system());
        let sweep = Arc::new(CountingSweep::new());
        let worker = TimerWorker::spawn(
            clock,
            vec![sweep.clone()],
            TimerWorkerConfig {
                interval: Duration::from_millis(5),
                ..Default::default()
            },
        );

        thread::sleep(Duration::from_millis(50));
        let stats = worker.shutdown();

        assert!(stats.rounds >= 1);
        assert!(sweep.calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = TimerWorkerConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.interval = Duration::from_millis(250);
        assert!(cfg.validate().is_err());
    }
}
