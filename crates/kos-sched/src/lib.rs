//! # kos-sched
//!
//! The multi-class CPU scheduler: per-CPU runqueues with a fair class
//! (weighted virtual runtime on an ordered index), a real-time class
//! (priority bitmap, FIFO/RR), an idle fallback, and periodic load
//! balancing. A dedicated dispatcher thread services every CPU once per
//! tick; tests drive [`Scheduler::dispatch`] directly against a manual
//! clock instead.
//!
//! ## Modules
//!
//! - `config` - tunables and validation
//! - `task` - tasks, states, policies, the nice-to-weight table
//! - `fair` - fair sub-runqueue (ordered index keyed by vruntime)
//! - `rt` - RT sub-runqueue (100 rings plus occupancy bitmap)
//! - `runqueue` - per-CPU combination of the classes
//! - `balance` - periodic load balancing across CPUs
//!
//! ## Locking
//!
//! Lock order is scheduler globals → runqueue → task scheduling state.
//! The task registry read lock may be taken under a runqueue lock; the
//! write lock never is. Wakeups from arbitrary threads go through a
//! lock-free queue drained at the top of every dispatcher pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use kos_core::clock::Clock;
use kos_core::error::{KernelError, KernelResult};
use kos_core::stats::Counter;
use kos_core::TaskId;

pub mod balance;
pub mod config;
pub mod fair;
pub mod rt;
pub mod runqueue;
pub mod task;

// Re-exports for convenience
pub use config::SchedConfig;
pub use task::{SchedPolicy, Task, TaskState};

use fair::calc_delta_fair;
use runqueue::Runqueue;
use task::{weight_for_nice, NICE_0_WEIGHT, RT_RR_SLICE};

/// Point-in-time view of one runqueue for observers and tests
#[derive(Debug, Clone)]
pub struct RqSnapshot {
    pub cpu: usize,
    pub current: TaskId,
    pub idle: TaskId,
    pub nr_switches: u64,
    pub nr_running: u32,
    pub load_weight: u64,
    pub min_vruntime: u64,
    pub rt_highest_prio: usize,
    pub rt_throttled: bool,
    pub loadavg_hundredths: [u64; 3],
}

/// Advisory scheduler counters
#[derive(Debug, Default)]
pub struct SchedStats {
    pub switches: Counter,
    pub wakeups: Counter,
    pub migrations: Counter,
    pub rt_throttles: Counter,
    pub balance_passes: Counter,
}

/// The scheduler
///
/// Owns the task registry and one runqueue per CPU. All control calls
/// validate their task handle and return `NotFound` for a stale one.
pub struct Scheduler {
    pub(crate) config: SchedConfig,
    clock: Arc<Clock>,

    pub(crate) tasks: RwLock<HashMap<TaskId, Arc<Task>>>,
    pub(crate) runqueues: Vec<Mutex<Runqueue>>,
    next_id: AtomicU32,

    /// Cross-thread wakeup requests, drained each dispatcher pass
    wakeups: SegQueue<TaskId>,

    running: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    last_balance: Mutex<Duration>,

    pub stats: SchedStats,
}

impl Scheduler {
    /// Create a scheduler with default tunables and a system clock
    pub fn init(nr_cpus: usize) -> KernelResult<Self> {
        Self::with_config(SchedConfig::new(nr_cpus), Arc::new(Clock::system()))
    }

    /// Create a scheduler with explicit tunables and clock
    pub fn with_config(config: SchedConfig, clock: Arc<Clock>) -> KernelResult<Self> {
        config.validate()?;
        let now = clock.now();

        let mut tasks = HashMap::new();
        let mut runqueues = Vec::with_capacity(config.nr_cpus);
        let mut next_id = 0u32;

        for cpu in 0..config.nr_cpus {
            let id = TaskId::new(next_id);
            next_id += 1;
            let idle = Task::new(id, 0, &format!("swapper/{}", cpu), config.nr_cpus, now)?;
            idle.set_state(TaskState::Running);
            idle.set_cpu(cpu);
            {
                let mut sched = idle.sched.lock().unwrap();
                sched.policy = SchedPolicy::Idle;
            }
            tasks.insert(id, Arc::new(idle));
            runqueues.push(Mutex::new(Runqueue::new(cpu, id)));
        }

        Ok(Scheduler {
            config,
            clock,
            tasks: RwLock::new(tasks),
            runqueues,
            next_id: AtomicU32::new(next_id),
            wakeups: SegQueue::new(),
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
            last_balance: Mutex::new(Duration::ZERO),
            stats: SchedStats::default(),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.config.nr_cpus
    }

    /// Start the dispatcher thread
    pub fn start(self: &Arc<Self>) -> KernelResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyConnected);
        }
        let sched = self.clone();
        let handle = std::thread::Builder::new()
            .name("kos-sched".into())
            .spawn(move || {
                log::debug!("dispatcher started for {} cpus", sched.config.nr_cpus);
                while sched.running.load(Ordering::Acquire) {
                    sched.dispatch();
                    std::thread::sleep(sched.config.tick_interval);
                }
                log::debug!("dispatcher stopped");
            })
            .map_err(|_| KernelError::ResourceExhausted)?;
        *self.dispatcher.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop and join the dispatcher thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Create a task; it sleeps until woken
    pub fn create_task(&self, pid: u32, name: &str) -> KernelResult<TaskId> {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(Task::new(id, pid, name, self.config.nr_cpus, self.clock.now())?);
        self.tasks.write().unwrap().insert(id, task);
        log::debug!("created task {} ({})", id, name);
        Ok(id)
    }

    /// Remove a task from every runqueue and the registry
    pub fn destroy_task(&self, id: TaskId) -> KernelResult<()> {
        let task = self.task(id)?;
        if task.pid == 0 {
            // Per-CPU idle tasks live as long as the scheduler.
            return Err(KernelError::InvalidArgument);
        }
        task.set_state(TaskState::Zombie);

        let cpu = task.cpu();
        if cpu < self.runqueues.len() {
            let mut rq = self.runqueues[cpu].lock().unwrap();
            if task.is_on_rq() {
                self.dequeue_task(&mut rq, &task);
            }
            if rq.current == id {
                // The dispatcher swaps it for idle on the next pass.
                task.set_need_resched(true);
            }
        }

        task.usage_dec();
        self.tasks.write().unwrap().remove(&id);
        log::debug!("destroyed task {}", id);
        Ok(())
    }

    /// Look up a task handle
    pub fn task(&self, id: TaskId) -> KernelResult<Arc<Task>> {
        self.tasks
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    /// Make a task runnable and hand it to the dispatcher
    pub fn wake_up(&self, id: TaskId) -> KernelResult<()> {
        let task = self.task(id)?;
        match task.state() {
            TaskState::Zombie => return Err(KernelError::InvalidArgument),
            TaskState::Running => {}
            _ => task.set_state(TaskState::Running),
        }
        if !task.is_on_rq() {
            self.wakeups.push(id);
            self.stats.wakeups.inc();
        }
        Ok(())
    }

    /// Change a task's run state
    pub fn set_state(&self, id: TaskId, state: TaskState) -> KernelResult<()> {
        let task = self.task(id)?;
        if state == TaskState::Running {
            return self.wake_up(id);
        }
        task.set_state(state);

        let cpu = task.cpu();
        if cpu < self.runqueues.len() {
            let mut rq = self.runqueues[cpu].lock().unwrap();
            if task.is_on_rq() {
                self.dequeue_task(&mut rq, &task);
            }
            if rq.current == id {
                task.set_need_resched(true);
            }
        }
        Ok(())
    }

    /// Change a task's nice value, reweighting it in place
    pub fn set_nice(&self, id: TaskId, nice: i32) -> KernelResult<()> {
        let weight = weight_for_nice(nice)?;
        let task = self.task(id)?;

        let cpu = task.cpu();
        let mut rq = self.runqueues[cpu.min(self.runqueues.len() - 1)]
            .lock()
            .unwrap();
        let mut sched = task.sched.lock().unwrap();
        let was_queued = task.is_on_rq() && !sched.policy.is_realtime();
        if was_queued {
            rq.fair
                .dequeue(id, sched.fair.vruntime, sched.fair.load_weight);
        }
        sched.nice = nice;
        sched.fair.load_weight = weight;
        if was_queued {
            rq.fair.requeue(id, sched.fair.vruntime, weight);
        }
        if rq.current == id && !sched.policy.is_realtime() {
            rq.current_weight = weight;
        }
        Ok(())
    }

    /// Change a task's scheduling policy
    pub fn set_policy(&self, id: TaskId, policy: SchedPolicy) -> KernelResult<()> {
        let task = self.task(id)?;
        let cpu = task.cpu();
        let mut rq = self.runqueues[cpu.min(self.runqueues.len() - 1)]
            .lock()
            .unwrap();

        let was_queued = task.is_on_rq();
        if was_queued {
            self.dequeue_task(&mut rq, &task);
        }
        {
            let mut sched = task.sched.lock().unwrap();
            sched.policy = policy;
            if policy.is_realtime() {
                sched.rt.time_slice = RT_RR_SLICE;
            }
        }
        if was_queued {
            self.enqueue_task(&mut rq, &task);
        }
        if rq.current == id {
            rq.current_is_rt = policy.is_realtime();
        }
        Ok(())
    }

    /// Change a task's RT priority (0-99, lower is more urgent)
    pub fn set_rt_priority(&self, id: TaskId, prio: u8) -> KernelResult<()> {
        if prio as usize >= rt::RT_PRIO_COUNT {
            return Err(KernelError::InvalidArgument);
        }
        let task = self.task(id)?;
        let cpu = task.cpu();
        let mut rq = self.runqueues[cpu.min(self.runqueues.len() - 1)]
            .lock()
            .unwrap();

        let was_queued = task.is_on_rq();
        if was_queued {
            self.dequeue_task(&mut rq, &task);
        }
        task.sched.lock().unwrap().rt_prio = prio;
        if was_queued {
            self.enqueue_task(&mut rq, &task);
        }
        Ok(())
    }

    /// Restrict the CPUs a task may run on
    pub fn set_affinity(&self, id: TaskId, mask: u64) -> KernelResult<()> {
        let allowed = if self.config.nr_cpus >= 64 {
            u64::MAX
        } else {
            (1u64 << self.config.nr_cpus) - 1
        };
        if mask & allowed == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let task = self.task(id)?;
        task.sched.lock().unwrap().affinity = mask & allowed;

        // Requeue elsewhere if the current placement became illegal.
        if task.is_on_rq() && !task.allows_cpu(task.cpu()) {
            let cpu = task.cpu();
            let mut rq = self.runqueues[cpu].lock().unwrap();
            if task.is_on_rq() {
                self.dequeue_task(&mut rq, &task);
                drop(rq);
                self.wakeups.push(id);
            }
        }
        Ok(())
    }

    /// The task currently on a CPU
    pub fn current_task(&self, cpu: usize) -> KernelResult<TaskId> {
        if cpu >= self.runqueues.len() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self.runqueues[cpu].lock().unwrap().current)
    }

    /// Advisory snapshot of one runqueue
    pub fn rq_snapshot(&self, cpu: usize) -> KernelResult<RqSnapshot> {
        if cpu >= self.runqueues.len() {
            return Err(KernelError::InvalidArgument);
        }
        let rq = self.runqueues[cpu].lock().unwrap();
        Ok(RqSnapshot {
            cpu,
            current: rq.current,
            idle: rq.idle,
            nr_switches: rq.nr_switches,
            nr_running: rq.nr_running,
            load_weight: rq.load_weight(),
            min_vruntime: rq.fair.min_vruntime,
            rt_highest_prio: rq.rt.highest_prio(),
            rt_throttled: rq.rt.throttled,
            loadavg_hundredths: rq.loadavg_hundredths(),
        })
    }

    /// Queue a task on a runqueue's class structure (lock held)
    pub(crate) fn enqueue_task(&self, rq: &mut Runqueue, task: &Arc<Task>) {
        let mut sched = task.sched.lock().unwrap();
        if sched.policy.is_realtime() {
            rq.rt.enqueue(sched.rt_prio as usize, task.id);
        } else {
            let weight = sched.fair.load_weight;
            let new_task = sched.fair.new_task;
            sched.fair.new_task = false;
            let mut vruntime = sched.fair.vruntime;
            rq.fair
                .enqueue(task.id, &mut vruntime, weight, new_task, self.config.sched_latency);
            sched.fair.vruntime = vruntime;
        }
        drop(sched);
        task.set_on_rq(true);
        task.set_cpu(rq.cpu);
        self.refresh_nr_running(rq);
    }

    /// Remove a queued task from its class structure (lock held)
    pub(crate) fn dequeue_task(&self, rq: &mut Runqueue, task: &Arc<Task>) -> bool {
        let sched = task.sched.lock().unwrap();
        let removed = if sched.policy.is_realtime() {
            rq.rt.dequeue(sched.rt_prio as usize, task.id)
        } else {
            rq.fair
                .dequeue(task.id, sched.fair.vruntime, sched.fair.load_weight)
        };
        drop(sched);
        if removed {
            task.set_on_rq(false);
            self.refresh_nr_running(rq);
        }
        removed
    }

    /// One dispatcher pass: place wakeups, tick every CPU, balance
    ///
    /// The dispatcher thread calls this once per tick; tests call it
    /// directly after advancing a manual clock.
    pub fn dispatch(&self) {
        let now = self.clock.now();
        self.drain_wakeups();
        for cpu in 0..self.runqueues.len() {
            self.tick_cpu(cpu, now);
        }

        let balance_due = {
            let mut last = self.last_balance.lock().unwrap();
            if now.saturating_sub(*last) >= self.config.balance_interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if balance_due {
            self.balance(now);
        }
    }

    /// Place queued wakeups on the least-loaded allowed CPU
    fn drain_wakeups(&self) {
        while let Some(id) = self.wakeups.pop() {
            let task = match self.task(id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if task.state() != TaskState::Running || task.is_on_rq() {
                continue;
            }
            // Already on a CPU: nothing to place.
            let cpu = task.cpu();
            if cpu < self.runqueues.len()
                && self.runqueues[cpu].lock().unwrap().current == id
            {
                continue;
            }

            let target = self.select_cpu(&task);
            let mut rq = self.runqueues[target].lock().unwrap();
            self.enqueue_task(&mut rq, &task);
            self.check_wakeup_preemption(&mut rq, &task);
        }
    }

    /// Pick the CPU with minimum load among the task's allowed set
    fn select_cpu(&self, task: &Arc<Task>) -> usize {
        let mut best = task.cpu().min(self.runqueues.len() - 1);
        let mut best_load = u64::MAX;
        for (cpu, rq) in self.runqueues.iter().enumerate() {
            if !task.allows_cpu(cpu) {
                continue;
            }
            let load = rq.lock().unwrap().load_weight();
            if load < best_load {
                best_load = load;
                best = cpu;
            }
        }
        best
    }

    /// Ask the current task to yield if the newcomer deserves the CPU
    fn check_wakeup_preemption(&self, rq: &mut Runqueue, woken: &Arc<Task>) {
        if rq.is_idle() {
            return;
        }
        let current = match self.task(rq.current) {
            Ok(t) => t,
            Err(_) => return,
        };

        let woken_sched = woken.sched.lock().unwrap();
        if woken_sched.policy.is_realtime() {
            let preempts = if rq.current_is_rt {
                let curr_prio = current.sched.lock().unwrap().rt_prio;
                woken_sched.rt_prio < curr_prio
            } else {
                true
            };
            if preempts {
                current.set_need_resched(true);
            }
            return;
        }
        if rq.current_is_rt {
            return;
        }

        // Fair wakeup preemption with hysteresis.
        let gran = self.config.wakeup_granularity.as_nanos() as u64;
        let curr_vruntime = current.sched.lock().unwrap().fair.vruntime;
        if woken_sched.fair.vruntime + gran < curr_vruntime {
            current.set_need_resched(true);
        }
    }

    /// Account the running task and reschedule if required
    fn tick_cpu(&self, cpu: usize, now: Duration) {
        let mut rq = self.runqueues[cpu].lock().unwrap();
        let delta = now.saturating_sub(rq.clock_last);
        rq.clock_last = now;

        let mut need_resched = false;
        let mut rotate_rr = false;

        if rq.is_idle() {
            rq.rt.update_period(now, self.config.rt_period);
            if !rq.fair.is_empty() || (!rq.rt.is_empty() && !rq.rt.throttled) {
                need_resched = true;
            }
        } else {
            let current = match self.task(rq.current) {
                Ok(t) => t,
                Err(_) => {
                    // A destroyed task slipped out of the registry while
                    // current; recover by switching to idle.
                    log::error!("cpu {}: current task {} vanished", cpu, rq.current);
                    rq.current = rq.idle;
                    rq.current_weight = 0;
                    rq.current_is_rt = false;
                    self.refresh_nr_running(&mut rq);
                    return;
                }
            };

            if !delta.is_zero() {
                let mut sched = current.sched.lock().unwrap();
                sched.utime += delta;

                if sched.policy.is_realtime() {
                    if rq.rt.account(delta, now, self.config.rt_period, self.config.rt_runtime) {
                        self.stats.rt_throttles.inc();
                        need_resched = true;
                    }
                    if sched.policy == SchedPolicy::Rr {
                        if sched.rt.time_slice <= delta {
                            sched.rt.time_slice = RT_RR_SLICE;
                            sched.rt.timeout_count += 1;
                            rotate_rr = true;
                            need_resched = true;
                        } else {
                            sched.rt.time_slice -= delta;
                        }
                    }
                } else {
                    sched.fair.vruntime += calc_delta_fair(delta, sched.fair.load_weight);
                    sched.fair.exec_total += delta;
                    let current_vruntime = sched.fair.vruntime;
                    let weight = sched.fair.load_weight;
                    drop(sched);

                    // The RT period keeps rolling while fair runs, so a
                    // throttle never outlives its period.
                    rq.rt.update_period(now, self.config.rt_period);
                    rq.fair.update_min_vruntime(Some(current_vruntime));
                    let slice = rq.fair.time_slice(
                        weight,
                        u64::from(weight),
                        self.config.sched_latency,
                        self.config.min_granularity,
                    );
                    if now.saturating_sub(rq.picked_at) >= slice {
                        need_resched = true;
                    }
                }
            }

            // A runnable RT task preempts any fair task.
            if !rq.rt.is_empty() && !rq.rt.throttled && !rq.current_is_rt {
                need_resched = true;
            }
            if current.needs_resched() || current.state() != TaskState::Running {
                need_resched = true;
            }
            // A throttled RT current must give way to fair/idle.
            if rq.current_is_rt && rq.rt.throttled {
                need_resched = true;
            }
        }

        if need_resched {
            self.reschedule(&mut rq, now, rotate_rr);
        }
        self.refresh_nr_running(&mut rq);
        rq.update_loadavg(now);
    }

    fn refresh_nr_running(&self, rq: &mut Runqueue) {
        rq.nr_running =
            rq.fair.nr_running + rq.rt.nr_running + if rq.is_idle() { 0 } else { 1 };
    }

    /// Swap the current task for the best runnable one
    fn reschedule(&self, rq: &mut Runqueue, now: Duration, rotate_rr: bool) {
        let prev_id = rq.current;

        // Put the previous task back on its class queue if still
        // runnable; a blocked task just leaves the CPU.
        if prev_id != rq.idle {
            if let Ok(prev) = self.task(prev_id) {
                prev.set_need_resched(false);
                if prev.state() == TaskState::Running {
                    let sched = prev.sched.lock().unwrap();
                    if sched.policy.is_realtime() {
                        let prio = sched.rt_prio as usize;
                        drop(sched);
                        if rotate_rr {
                            rq.rt.requeue_tail(prio, prev_id);
                        } else {
                            rq.rt.enqueue_head(prio, prev_id);
                        }
                    } else {
                        let (v, w) = (sched.fair.vruntime, sched.fair.load_weight);
                        drop(sched);
                        rq.fair.requeue(prev_id, v, w);
                    }
                    prev.set_on_rq(true);
                }
            }
        }

        // Pick: RT first unless throttled, then fair, then idle. A task
        // that stopped being runnable while queued is skipped.
        let mut next: Option<(TaskId, u32, bool)> = None;
        while next.is_none() {
            let candidate = if !rq.rt.throttled {
                rq.rt.pick_next().map(|(_, id)| (id, true))
            } else {
                None
            };
            let candidate = match candidate {
                Some(c) => Some(c),
                None => {
                    let tasks = self.tasks.read().unwrap();
                    rq.fair
                        .pick_next(|tid| {
                            tasks
                                .get(&tid)
                                .map(|t| t.sched.lock().unwrap().fair.load_weight)
                                .unwrap_or(NICE_0_WEIGHT)
                        })
                        .map(|(_, id)| (id, false))
                }
            };

            match candidate {
                None => {
                    next = Some((rq.idle, 0, false));
                }
                Some((id, is_rt)) => match self.task(id) {
                    Ok(task) if task.state() == TaskState::Running => {
                        task.set_on_rq(false);
                        let weight = if is_rt {
                            NICE_0_WEIGHT
                        } else {
                            task.sched.lock().unwrap().fair.load_weight
                        };
                        task.set_cpu(rq.cpu);
                        next = Some((id, weight, is_rt));
                    }
                    _ => {
                        // Stale entry; keep looking.
                        continue;
                    }
                },
            }
        }

        let (next_id, weight, is_rt) = next.expect("loop assigns");
        rq.current = next_id;
        rq.current_weight = weight;
        rq.current_is_rt = is_rt;
        rq.picked_at = now;
        if next_id != prev_id {
            rq.nr_switches += 1;
            self.stats.switches.inc();
            log::trace!("cpu {}: switch {} -> {}", rq.cpu, prev_id, next_id);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
