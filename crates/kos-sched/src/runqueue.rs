//! Per-CPU runqueue
//!
//! Each CPU owns one `Runqueue` behind its own lock: the fair and RT
//! sub-runqueues, the current task, and per-CPU accounting. Exactly one
//! task is current at all times; with nothing runnable it is the CPU's
//! idle task.

use std::time::Duration;

use kos_core::TaskId;

use crate::fair::FairRq;
use crate::rt::RtRq;
use crate::task::NICE_0_WEIGHT;

/// Fixed-point scale for load averages
const LOAD_FIXED_1: u64 = 2048;
/// Decay factors for 1/5/15-minute averages at one sample per 5s
const LOAD_EXP: [u64; 3] = [1884, 2014, 2037];
/// Load average sampling interval
const LOADAVG_INTERVAL: Duration = Duration::from_secs(5);

/// One CPU's scheduling state
pub struct Runqueue {
    pub cpu: usize,

    /// Task currently on the CPU (the idle task when nothing runs)
    pub current: TaskId,
    pub idle: TaskId,

    pub fair: FairRq,
    pub rt: RtRq,

    /// Context switches performed
    pub nr_switches: u64,
    /// Runnable tasks (queued plus current, excluding idle)
    pub nr_running: u32,

    /// When the current task was put on the CPU
    pub picked_at: Duration,
    /// Last time this runqueue was ticked
    pub clock_last: Duration,

    /// Weight of the current task while it runs off-index
    pub current_weight: u32,
    /// Whether the current task belongs to the RT class
    pub current_is_rt: bool,

    /// 1/5/15-minute load averages, fixed point
    pub loadavg: [u64; 3],
    last_loadavg: Duration,
}

impl Runqueue {
    pub fn new(cpu: usize, idle: TaskId) -> Self {
        Runqueue {
            cpu,
            current: idle,
            idle,
            fair: FairRq::new(),
            rt: RtRq::new(),
            nr_switches: 0,
            nr_running: 0,
            picked_at: Duration::ZERO,
            clock_last: Duration::ZERO,
            current_weight: 0,
            current_is_rt: false,
            loadavg: [0; 3],
            last_loadavg: Duration::ZERO,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.current == self.idle
    }

    /// Aggregate load weight for balancing decisions
    ///
    /// Queued fair weight plus the running fair task's weight; each RT
    /// task counts as one nice-0 weight since the fair metric does not
    /// apply to it.
    pub fn load_weight(&self) -> u64 {
        let running_fair = if !self.is_idle() && !self.current_is_rt {
            u64::from(self.current_weight)
        } else {
            0
        };
        let rt_count = u64::from(self.rt.nr_running)
            + if self.current_is_rt { 1 } else { 0 };
        self.fair.load_weight + running_fair + rt_count * u64::from(NICE_0_WEIGHT)
    }

    /// Refresh the 1/5/15-minute averages if a sample is due
    pub fn update_loadavg(&mut self, now: Duration) {
        if now.saturating_sub(self.last_loadavg) < LOADAVG_INTERVAL {
            return;
        }
        self.last_loadavg = now;
        let active = u64::from(self.nr_running) * LOAD_FIXED_1;
        for (avg, exp) in self.loadavg.iter_mut().zip(LOAD_EXP) {
            *avg = (*avg * exp + active * (LOAD_FIXED_1 - exp)) / LOAD_FIXED_1;
        }
    }

    /// Load averages scaled to task counts (hundredths)
    pub fn loadavg_hundredths(&self) -> [u64; 3] {
        let mut out = [0; 3];
        for (slot, avg) in out.iter_mut().zip(self.loadavg) {
            *slot = avg * 100 / LOAD_FIXED_1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runqueue_is_idle() {
        let idle = TaskId::new(0);
        let rq = Runqueue::new(0, idle);
        assert!(rq.is_idle());
        assert_eq!(rq.current, idle);
        assert_eq!(rq.load_weight(), 0);
    }

    #[test]
    fn test_load_weight_counts_classes() {
        let mut rq = Runqueue::new(0, TaskId::new(0));
        let mut v = 0u64;
        rq.fair
            .enqueue(TaskId::new(1), &mut v, 1024, false, Duration::from_millis(6));
        rq.rt.enqueue(10, TaskId::new(2));
        assert_eq!(rq.load_weight(), 1024 + 1024);

        // A running fair task keeps contributing its weight.
        rq.current = TaskId::new(3);
        rq.current_weight = 335;
        rq.current_is_rt = false;
        assert_eq!(rq.load_weight(), 1024 + 1024 + 335);
    }

    #[test]
    fn test_loadavg_rises_under_load() {
        let mut rq = Runqueue::new(0, TaskId::new(0));
        rq.nr_running = 2;
        let mut now = Duration::ZERO;
        for _ in 0..60 {
            now += LOADAVG_INTERVAL;
            rq.update_loadavg(now);
        }
        let [one, five, fifteen] = rq.loadavg_hundredths();
        // After five minutes of two runnable tasks the 1-minute average
        // is close to 2.00 and the longer windows lag behind it.
        assert!(one > 150, "one-minute avg {}", one);
        assert!(five <= one);
        assert!(fifteen <= five);
    }
}
