//! Real-time scheduling class
//!
//! One ring per priority 0-99 (lower is more urgent), a 100-bit
//! occupancy bitmap scanned for the first set bit, and a cached
//! highest-priority index. SCHED_RR rotates at slice exhaustion;
//! SCHED_FIFO runs until it yields or a higher priority preempts it.
//! Class-wide bandwidth is capped so RT load cannot monopolize a CPU.

use std::collections::VecDeque;
use std::time::Duration;

use kos_core::TaskId;

/// Number of RT priorities
pub const RT_PRIO_COUNT: usize = 100;

/// Bitmap words covering the priority range
const BITMAP_WORDS: usize = 2;

/// Occupancy bitmap over the 100 priorities
///
/// Plain words, always mutated under the runqueue lock; bit *p* is set
/// iff the list at priority *p* is non-empty.
#[derive(Debug, Default)]
pub struct PrioBitmap {
    words: [u64; BITMAP_WORDS],
}

impl PrioBitmap {
    pub fn new() -> Self {
        PrioBitmap { words: [0; BITMAP_WORDS] }
    }

    #[inline]
    pub fn set(&mut self, prio: usize) {
        debug_assert!(prio < RT_PRIO_COUNT);
        self.words[prio / 64] |= 1u64 << (prio % 64);
    }

    #[inline]
    pub fn clear(&mut self, prio: usize) {
        debug_assert!(prio < RT_PRIO_COUNT);
        self.words[prio / 64] &= !(1u64 << (prio % 64));
    }

    #[inline]
    pub fn is_set(&self, prio: usize) -> bool {
        self.words[prio / 64] & (1u64 << (prio % 64)) != 0
    }

    /// First set bit, or `RT_PRIO_COUNT` when empty
    pub fn first_set(&self) -> usize {
        for (i, word) in self.words.iter().enumerate() {
            if *word != 0 {
                return i * 64 + word.trailing_zeros() as usize;
            }
        }
        RT_PRIO_COUNT
    }
}

/// RT sub-runqueue
pub struct RtRq {
    /// One FIFO ring per priority
    queues: Vec<VecDeque<TaskId>>,
    bitmap: PrioBitmap,
    pub nr_running: u32,
    /// Cached first set bit of the bitmap
    highest: usize,

    /// Bandwidth accounting inside the current period
    pub rt_time: Duration,
    period_start: Duration,
    pub throttled: bool,
}

impl RtRq {
    pub fn new() -> Self {
        RtRq {
            queues: (0..RT_PRIO_COUNT).map(|_| VecDeque::new()).collect(),
            bitmap: PrioBitmap::new(),
            nr_running: 0,
            highest: RT_PRIO_COUNT,
            rt_time: Duration::ZERO,
            period_start: Duration::ZERO,
            throttled: false,
        }
    }

    /// Queue at the tail of its priority ring
    pub fn enqueue(&mut self, prio: usize, id: TaskId) {
        debug_assert!(prio < RT_PRIO_COUNT);
        self.queues[prio].push_back(id);
        self.bitmap.set(prio);
        self.nr_running += 1;
        self.highest = self.highest.min(prio);
    }

    /// Queue at the head of its priority ring
    ///
    /// A preempted SCHED_FIFO task resumes before its peers.
    pub fn enqueue_head(&mut self, prio: usize, id: TaskId) {
        debug_assert!(prio < RT_PRIO_COUNT);
        self.queues[prio].push_front(id);
        self.bitmap.set(prio);
        self.nr_running += 1;
        self.highest = self.highest.min(prio);
    }

    /// Remove a specific task from its ring
    pub fn dequeue(&mut self, prio: usize, id: TaskId) -> bool {
        let ring = &mut self.queues[prio];
        let before = ring.len();
        ring.retain(|t| *t != id);
        if ring.len() == before {
            return false;
        }
        if ring.is_empty() {
            self.bitmap.clear(prio);
            if self.highest == prio {
                self.highest = self.bitmap.first_set();
            }
        }
        self.nr_running -= 1;
        true
    }

    /// Head of the highest-priority non-empty ring
    pub fn peek_next(&self) -> Option<(usize, TaskId)> {
        if self.highest >= RT_PRIO_COUNT {
            return None;
        }
        self.queues[self.highest]
            .front()
            .map(|id| (self.highest, *id))
    }

    /// Take the head of the highest-priority ring
    pub fn pick_next(&mut self) -> Option<(usize, TaskId)> {
        if self.highest >= RT_PRIO_COUNT {
            return None;
        }
        let prio = self.highest;
        let id = self.queues[prio].pop_front()?;
        if self.queues[prio].is_empty() {
            self.bitmap.clear(prio);
            self.highest = self.bitmap.first_set();
        }
        self.nr_running -= 1;
        Some((prio, id))
    }

    /// Rotate a SCHED_RR task to the tail of its ring
    pub fn requeue_tail(&mut self, prio: usize, id: TaskId) {
        self.enqueue(prio, id);
    }

    /// Highest queued priority, `RT_PRIO_COUNT` when empty
    pub fn highest_prio(&self) -> usize {
        self.highest
    }

    pub fn is_empty(&self) -> bool {
        self.nr_running == 0
    }

    /// Account RT execution; returns true when the class just throttled
    ///
    /// The period rolls forward first, clearing any throttle, then the
    /// running sum is compared with the cap.
    pub fn account(
        &mut self,
        delta: Duration,
        now: Duration,
        period: Duration,
        runtime: Duration,
    ) -> bool {
        if now.saturating_sub(self.period_start) >= period {
            self.period_start = now;
            self.rt_time = Duration::ZERO;
            self.throttled = false;
        }
        self.rt_time += delta;
        if !self.throttled && self.rt_time >= runtime {
            self.throttled = true;
            return true;
        }
        false
    }

    /// Roll the period if due (called even when no RT task is running)
    pub fn update_period(&mut self, now: Duration, period: Duration) {
        if now.saturating_sub(self.period_start) >= period {
            self.period_start = now;
            self.rt_time = Duration::ZERO;
            self.throttled = false;
        }
    }
}

impl Default for RtRq {
    fn default() -> Self {
        RtRq::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_tracks_occupancy() {
        let mut rq = RtRq::new();
        assert_eq!(rq.highest_prio(), RT_PRIO_COUNT);

        rq.enqueue(70, TaskId::new(1));
        rq.enqueue(10, TaskId::new(2));
        rq.enqueue(10, TaskId::new(3));

        // Bit p set iff list p non-empty, for every p.
        for p in 0..RT_PRIO_COUNT {
            assert_eq!(rq.bitmap.is_set(p), !rq.queues[p].is_empty(), "prio {}", p);
        }
        assert_eq!(rq.highest_prio(), 10);
    }

    #[test]
    fn test_pick_order_and_fifo_within_prio() {
        let mut rq = RtRq::new();
        rq.enqueue(10, TaskId::new(1));
        rq.enqueue(10, TaskId::new(2));
        rq.enqueue(5, TaskId::new(3));

        assert_eq!(rq.pick_next(), Some((5, TaskId::new(3))));
        assert_eq!(rq.pick_next(), Some((10, TaskId::new(1))));
        assert_eq!(rq.pick_next(), Some((10, TaskId::new(2))));
        assert_eq!(rq.pick_next(), None);
        assert_eq!(rq.highest_prio(), RT_PRIO_COUNT);
    }

    #[test]
    fn test_rr_rotation() {
        let mut rq = RtRq::new();
        rq.enqueue(20, TaskId::new(1));
        rq.enqueue(20, TaskId::new(2));

        let (prio, first) = rq.pick_next().unwrap();
        rq.requeue_tail(prio, first);
        // After rotation the other task is at the head.
        assert_eq!(rq.peek_next(), Some((20, TaskId::new(2))));
    }

    #[test]
    fn test_dequeue_clears_bits() {
        let mut rq = RtRq::new();
        rq.enqueue(42, TaskId::new(9));
        assert!(rq.dequeue(42, TaskId::new(9)));
        assert!(!rq.bitmap.is_set(42));
        assert!(rq.is_empty());
        assert!(!rq.dequeue(42, TaskId::new(9)));
    }

    #[test]
    fn test_bandwidth_throttle_and_period_roll() {
        let mut rq = RtRq::new();
        let period = Duration::from_secs(1);
        let runtime = Duration::from_millis(950);

        // 940ms of RT time: under the cap.
        let mut now = Duration::ZERO;
        for _ in 0..94 {
            now += Duration::from_millis(10);
            assert!(!rq.account(Duration::from_millis(10), now, period, runtime));
        }
        // Crossing 950ms throttles the class.
        now += Duration::from_millis(10);
        assert!(rq.account(Duration::from_millis(10), now, period, runtime));
        assert!(rq.throttled);

        // The next period clears the throttle.
        rq.update_period(Duration::from_millis(1100), period);
        assert!(!rq.throttled);
        assert_eq!(rq.rt_time, Duration::ZERO);
    }
}
