//! Fair scheduling class
//!
//! Tasks are ordered by virtual runtime in a balanced index (a
//! `BTreeSet` keyed by (vruntime, task id)); the leftmost entry is the
//! next task to run. The running task is removed from the index while it
//! executes and reinserted with its advanced vruntime when it yields the
//! CPU, so the ordering key never mutates in place.

use std::collections::BTreeSet;
use std::time::Duration;

use kos_core::TaskId;

use crate::task::NICE_0_WEIGHT;

/// Weighted vruntime advance for `delta` of real execution
///
/// A nice-0 task accrues wall time; lighter tasks accrue faster.
#[inline]
pub fn calc_delta_fair(delta: Duration, weight: u32) -> u64 {
    let delta_ns = delta.as_nanos() as u64;
    if weight == NICE_0_WEIGHT {
        delta_ns
    } else {
        delta_ns.saturating_mul(u64::from(NICE_0_WEIGHT)) / u64::from(weight.max(1))
    }
}

/// Fair sub-runqueue
pub struct FairRq {
    /// Ordered index of queued entities
    queue: BTreeSet<(u64, TaskId)>,
    pub nr_running: u32,
    /// Sum of queued weights plus the running fair task's weight
    pub load_weight: u64,
    /// Monotonically non-decreasing floor for new arrivals
    pub min_vruntime: u64,
}

impl FairRq {
    pub fn new() -> Self {
        FairRq {
            queue: BTreeSet::new(),
            nr_running: 0,
            load_weight: 0,
            min_vruntime: 0,
        }
    }

    /// Place a woken or forked entity and insert it
    ///
    /// Sleeper fairness: a wakeup may not claim more than half a latency
    /// period of credit. A brand-new task starts half a period behind
    /// instead, which keeps fork loops from starving everyone else.
    pub fn enqueue(
        &mut self,
        id: TaskId,
        vruntime: &mut u64,
        weight: u32,
        new_task: bool,
        latency: Duration,
    ) {
        let half_latency = (latency / 2).as_nanos() as u64;
        let placed = if new_task {
            self.min_vruntime + half_latency
        } else {
            (*vruntime).max(self.min_vruntime.saturating_sub(half_latency))
        };
        *vruntime = placed;

        self.queue.insert((placed, id));
        self.nr_running += 1;
        self.load_weight += u64::from(weight);
    }

    /// Re-insert the previously running entity with its current key
    pub fn requeue(&mut self, id: TaskId, vruntime: u64, weight: u32) {
        self.queue.insert((vruntime, id));
        self.nr_running += 1;
        self.load_weight += u64::from(weight);
    }

    /// Remove a queued entity; the caller supplies the key it was
    /// inserted with
    pub fn dequeue(&mut self, id: TaskId, vruntime: u64, weight: u32) -> bool {
        if self.queue.remove(&(vruntime, id)) {
            self.nr_running -= 1;
            self.load_weight = self.load_weight.saturating_sub(u64::from(weight));
            true
        } else {
            false
        }
    }

    /// Smallest-vruntime entity without removing it
    pub fn leftmost(&self) -> Option<(u64, TaskId)> {
        self.queue.iter().next().copied()
    }

    /// Take the smallest-vruntime entity off the index
    pub fn pick_next(&mut self, weight_of: impl Fn(TaskId) -> u32) -> Option<(u64, TaskId)> {
        let entry = self.leftmost()?;
        self.queue.remove(&entry);
        self.nr_running -= 1;
        self.load_weight = self
            .load_weight
            .saturating_sub(u64::from(weight_of(entry.1)));
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Snapshot of the queued entities in vruntime order
    ///
    /// The balancer walks this to pick migration candidates without
    /// holding a borrow on the index.
    pub fn queued(&self) -> Vec<(u64, TaskId)> {
        self.queue.iter().copied().collect()
    }

    /// Advance the floor; it never moves backwards
    pub fn update_min_vruntime(&mut self, current_vruntime: Option<u64>) {
        let mut candidate = match (current_vruntime, self.leftmost()) {
            (Some(curr), Some((left, _))) => curr.min(left),
            (Some(curr), None) => curr,
            (None, Some((left, _))) => left,
            (None, None) => return,
        };
        if candidate < self.min_vruntime {
            candidate = self.min_vruntime;
        }
        self.min_vruntime = candidate;
    }

    /// Ideal slice for a task of `weight` given the queue's total load
    ///
    /// `sched_latency * weight / total_weight`, clamped below at the
    /// minimum granularity.
    pub fn time_slice(
        &self,
        weight: u32,
        running_weight: u64,
        latency: Duration,
        min_granularity: Duration,
    ) -> Duration {
        let total = self.load_weight + running_weight;
        if total == 0 {
            return latency;
        }
        let slice_ns =
            (latency.as_nanos() as u64).saturating_mul(u64::from(weight)) / total.max(1);
        Duration::from_nanos(slice_ns).max(min_granularity)
    }
}

impl Default for FairRq {
    fn default() -> Self {
        FairRq::new()
    }
}
