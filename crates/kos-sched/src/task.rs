//! Tasks and the nice-to-weight mapping
//!
//! A task's immutable identity lives in plain fields; its volatile state
//! (run state, CPU, reschedule flag) in atomics so the dispatcher can
//! read them without the scheduling lock; and its scheduling parameters
//! behind a mutex taken after the owning runqueue's lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use kos_core::error::{KernelError, KernelResult};
use kos_core::TaskId;

/// Longest accepted command name
pub const TASK_COMM_LEN: usize = 15;

/// Load weight of a nice-0 task
pub const NICE_0_WEIGHT: u32 = 1024;

/// Nice-to-weight table, nice -20 first
///
/// Each step of one nice level is ~1.25x CPU share.
pub const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, // -20 .. -16
    29154, 23254, 18705, 14949, 11916, // -15 .. -11
    9548, 7620, 6100, 4904, 3906, // -10 .. -6
    3121, 2501, 1991, 1586, 1277, // -5 .. -1
    1024, 820, 655, 526, 423, // 0 .. 4
    335, 272, 215, 172, 137, // 5 .. 9
    110, 87, 70, 56, 45, // 10 .. 14
    36, 29, 23, 18, 15, // 15 .. 19
];

/// Weight for a nice value in [-20, 19]
pub fn weight_for_nice(nice: i32) -> KernelResult<u32> {
    if !(-20..=19).contains(&nice) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(NICE_TO_WEIGHT[(nice + 20) as usize])
}

/// Run states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Runnable or running
    Running = 0,
    /// Sleeping, signals wake it
    WaitInterruptible = 1,
    /// Sleeping, only an explicit wake moves it
    WaitUninterruptible = 2,
    /// Exited, awaiting reaping
    Zombie = 3,
    Stopped = 4,
    Traced = 5,
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskState::Running,
            1 => TaskState::WaitInterruptible,
            2 => TaskState::WaitUninterruptible,
            3 => TaskState::Zombie,
            4 => TaskState::Stopped,
            _ => TaskState::Traced,
        }
    }
}

/// Scheduling policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Normal,
    Fifo,
    Rr,
    Batch,
    Idle,
}

impl SchedPolicy {
    /// Policies served by the real-time class
    #[inline]
    pub fn is_realtime(&self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }
}

/// Fair-class accounting embedded in a task
#[derive(Debug, Clone)]
pub struct FairEntity {
    /// Weighted virtual runtime, nanoseconds
    pub vruntime: u64,
    /// Total execution time
    pub exec_total: Duration,
    /// Snapshot of `exec_total` at the previous accounting boundary
    pub prev_exec_total: Duration,
    pub load_weight: u32,
    /// Never been enqueued: the fork penalty still applies
    pub new_task: bool,
}

impl FairEntity {
    fn new() -> Self {
        FairEntity {
            vruntime: 0,
            exec_total: Duration::ZERO,
            prev_exec_total: Duration::ZERO,
            load_weight: NICE_0_WEIGHT,
            new_task: true,
        }
    }
}

/// RT-class accounting embedded in a task
#[derive(Debug, Clone)]
pub struct RtEntity {
    /// Remaining round-robin slice
    pub time_slice: Duration,
    /// Times the slice has been refilled
    pub timeout_count: u64,
}

/// Default round-robin slice
pub const RT_RR_SLICE: Duration = Duration::from_millis(100);

impl RtEntity {
    fn new() -> Self {
        RtEntity {
            time_slice: RT_RR_SLICE,
            timeout_count: 0,
        }
    }
}

/// Scheduling parameters, taken after the runqueue lock
pub struct TaskSched {
    pub policy: SchedPolicy,
    pub nice: i32,
    /// RT priority 0-99, lower is more urgent
    pub rt_prio: u8,
    /// CPU affinity bitmask
    pub affinity: u64,
    pub fair: FairEntity,
    pub rt: RtEntity,
    pub utime: Duration,
    pub stime: Duration,
}

/// A schedulable task
pub struct Task {
    pub id: TaskId,
    pub pid: u32,
    pub tgid: u32,
    pub comm: String,
    pub parent: Option<TaskId>,
    pub start_time: Duration,

    state: AtomicU8,
    cpu: AtomicU32,
    need_resched: AtomicBool,
    on_rq: AtomicBool,
    usage: AtomicU32,

    pub sched: Mutex<TaskSched>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        pid: u32,
        comm: &str,
        nr_cpus: usize,
        start_time: Duration,
    ) -> KernelResult<Self> {
        if comm.is_empty() || comm.len() > TASK_COMM_LEN {
            return Err(KernelError::InvalidArgument);
        }
        let affinity = if nr_cpus >= 64 { u64::MAX } else { (1u64 << nr_cpus) - 1 };
        Ok(Task {
            id,
            pid,
            tgid: pid,
            comm: comm.to_string(),
            parent: None,
            start_time,
            state: AtomicU8::new(TaskState::WaitInterruptible as u8),
            cpu: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            on_rq: AtomicBool::new(false),
            usage: AtomicU32::new(1),
            sched: Mutex::new(TaskSched {
                policy: SchedPolicy::Normal,
                nice: 0,
                rt_prio: 50,
                affinity,
                fair: FairEntity::new(),
                rt: RtEntity::new(),
                utime: Duration::ZERO,
                stime: Duration::ZERO,
            }),
        })
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu as u32, Ordering::Release);
    }

    #[inline]
    pub fn needs_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_need_resched(&self, v: bool) {
        self.need_resched.store(v, Ordering::Release);
    }

    #[inline]
    pub fn is_on_rq(&self) -> bool {
        self.on_rq.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_on_rq(&self, v: bool) {
        self.on_rq.store(v, Ordering::Release);
    }

    #[inline]
    pub fn get_usage(&self) -> u32 {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn usage_inc(&self) {
        self.usage.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn usage_dec(&self) -> u32 {
        self.usage.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Static priority in the 0-139 convention (RT 0-99, nice above)
    pub fn static_prio(&self) -> u32 {
        let sched = self.sched.lock().unwrap();
        if sched.policy.is_realtime() {
            sched.rt_prio as u32
        } else {
            (120 + sched.nice) as u32
        }
    }

    /// Whether `cpu` is allowed by the affinity mask
    pub fn allows_cpu(&self, cpu: usize) -> bool {
        let sched = self.sched.lock().unwrap();
        cpu < 64 && sched.affinity & (1u64 << cpu) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_table_anchors() {
        assert_eq!(weight_for_nice(-20).unwrap(), 88761);
        assert_eq!(weight_for_nice(0).unwrap(), 1024);
        assert_eq!(weight_for_nice(5).unwrap(), 335);
        assert_eq!(weight_for_nice(10).unwrap(), 110);
        assert_eq!(weight_for_nice(19).unwrap(), 15);
        assert!(weight_for_nice(-21).is_err());
        assert!(weight_for_nice(20).is_err());
    }

    #[test]
    fn test_task_creation_validates_comm() {
        assert!(Task::new(TaskId::new(1), 1, "", 4, Duration::ZERO).is_err());
        assert!(Task::new(TaskId::new(1), 1, "a-very-long-task-name", 4, Duration::ZERO).is_err());
        let t = Task::new(TaskId::new(1), 1, "worker", 4, Duration::ZERO).unwrap();
        assert_eq!(t.state(), TaskState::WaitInterruptible);
        assert_eq!(t.static_prio(), 120);
    }

    #[test]
    fn test_affinity_mask_default() {
        let t = Task::new(TaskId::new(1), 1, "w", 2, Duration::ZERO).unwrap();
        assert!(t.allows_cpu(0));
        assert!(t.allows_cpu(1));
        assert!(!t.allows_cpu(2));
    }

    #[test]
    fn test_priority_convention() {
        let t = Task::new(TaskId::new(1), 1, "rt", 1, Duration::ZERO).unwrap();
        {
            let mut sched = t.sched.lock().unwrap();
            sched.policy = SchedPolicy::Fifo;
            sched.rt_prio = 10;
        }
        assert_eq!(t.static_prio(), 10);
    }
}
