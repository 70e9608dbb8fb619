//! Load balancing
//!
//! Every balance interval each CPU compares itself with the most loaded
//! peer and pulls queued fair tasks while the imbalance exceeds one
//! nice-0 weight, up to the migration batch cap. Only queued (not
//! running) fair tasks move, and only onto CPUs their affinity allows;
//! RT rings stay put, their placement is wakeup-driven.

use std::time::Duration;

use kos_core::TaskId;

use crate::task::NICE_0_WEIGHT;
use crate::Scheduler;

impl Scheduler {
    /// One balancing pass over all CPUs
    pub(crate) fn balance(&self, _now: Duration) {
        self.stats.balance_passes.inc();
        let n = self.runqueues.len();
        if n < 2 {
            return;
        }

        let loads: Vec<u64> = (0..n)
            .map(|cpu| self.runqueues[cpu].lock().unwrap().load_weight())
            .collect();

        for cpu in 0..n {
            let (busiest, busiest_load) = match loads
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != cpu)
                .max_by_key(|(_, load)| **load)
            {
                Some((i, load)) => (i, *load),
                None => continue,
            };

            if busiest_load <= loads[cpu] + u64::from(NICE_0_WEIGHT) {
                continue;
            }
            self.pull_tasks(cpu, busiest);
        }
    }

    /// Migrate queued fair tasks from `src` to `dst` until balanced
    fn pull_tasks(&self, dst: usize, src: usize) {
        // Lock the pair in index order to keep the pair acquisition
        // deadlock-free against a concurrent balance of the reverse
        // direction.
        let (first, second) = if dst < src { (dst, src) } else { (src, dst) };
        let mut rq_first = self.runqueues[first].lock().unwrap();
        let mut rq_second = self.runqueues[second].lock().unwrap();
        let (rq_dst, rq_src) = if dst < src {
            (&mut *rq_first, &mut *rq_second)
        } else {
            (&mut *rq_second, &mut *rq_first)
        };

        let mut migrated = 0usize;
        let candidates: Vec<(u64, TaskId)> = rq_src.fair.queued();

        for (vruntime, id) in candidates {
            if migrated >= self.config.nr_migrate {
                break;
            }
            if rq_src.load_weight() <= rq_dst.load_weight() + u64::from(NICE_0_WEIGHT) {
                break;
            }
            let task = match self.task(id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if !task.allows_cpu(dst) {
                continue;
            }

            let mut sched = task.sched.lock().unwrap();
            if !rq_src
                .fair
                .dequeue(id, vruntime, sched.fair.load_weight)
            {
                continue;
            }

            // Carry the vruntime across queues relative to each side's
            // floor so the task neither gains nor loses credit.
            let offset = sched.fair.vruntime.saturating_sub(rq_src.fair.min_vruntime);
            sched.fair.vruntime = rq_dst.fair.min_vruntime + offset;
            let weight = sched.fair.load_weight;
            rq_dst.fair.requeue(id, sched.fair.vruntime, weight);
            drop(sched);

            task.set_cpu(dst);
            migrated += 1;
            self.stats.migrations.inc();
        }

        if migrated > 0 {
            self.refresh_nr_running(rq_src);
            self.refresh_nr_running(rq_dst);
            log::trace!("balance: pulled {} tasks {} -> {}", migrated, src, dst);
        }
    }
}
