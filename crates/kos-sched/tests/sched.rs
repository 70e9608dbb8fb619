//! Scheduler behaviour driven tick by tick against a manual clock

use std::sync::Arc;
use std::time::Duration;

use kos_core::clock::Clock;
use kos_sched::{SchedConfig, SchedPolicy, Scheduler, TaskState};

struct Harness {
    clock: Arc<Clock>,
    sched: Arc<Scheduler>,
}

fn harness(cpus: usize) -> Harness {
    let clock = Arc::new(Clock::manual());
    let sched =
        Arc::new(Scheduler::with_config(SchedConfig::new(cpus), clock.clone()).unwrap());
    Harness { clock, sched }
}

impl Harness {
    /// Advance simulated time one millisecond and run a dispatcher pass
    fn tick(&self) {
        self.clock.advance(Duration::from_millis(1));
        self.sched.dispatch();
    }

    fn tick_n(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
}

#[test]
fn fair_shares_follow_weights() {
    let h = harness(1);

    // Nice 0, 5 and 10: weights 1024, 335 and 110.
    let a = h.sched.create_task(1, "nice0").unwrap();
    let b = h.sched.create_task(2, "nice5").unwrap();
    let c = h.sched.create_task(3, "nice10").unwrap();
    h.sched.set_nice(b, 5).unwrap();
    h.sched.set_nice(c, 10).unwrap();
    for id in [a, b, c] {
        h.sched.wake_up(id).unwrap();
    }

    h.tick_n(600);

    let exec = |id| {
        h.sched
            .task(id)
            .unwrap()
            .sched
            .lock()
            .unwrap()
            .fair
            .exec_total
            .as_secs_f64()
    };
    let (ea, eb, ec) = (exec(a), exec(b), exec(c));
    assert!(ea > 0.0 && eb > 0.0 && ec > 0.0);

    // Executed time splits like the weights, within ten percent.
    let total = ea + eb + ec;
    let check = |measured: f64, weight: f64| {
        let expected = weight / (1024.0 + 335.0 + 110.0);
        let share = measured / total;
        assert!(
            (share - expected).abs() / expected < 0.10,
            "share {:.4} vs expected {:.4}",
            share,
            expected
        );
    };
    check(ea, 1024.0);
    check(eb, 335.0);
    check(ec, 110.0);
}

#[test]
fn rt_task_preempts_normal() {
    let h = harness(1);

    let low = h.sched.create_task(10, "low").unwrap();
    h.sched.wake_up(low).unwrap();
    h.tick();
    assert_eq!(h.sched.current_task(0).unwrap(), low);

    let high = h.sched.create_task(11, "high").unwrap();
    h.sched.set_policy(high, SchedPolicy::Fifo).unwrap();
    h.sched.set_rt_priority(high, 10).unwrap();
    h.sched.wake_up(high).unwrap();

    // The very next dispatcher pass puts the RT task on the CPU.
    h.tick();
    assert_eq!(h.sched.current_task(0).unwrap(), high);

    // FIFO keeps running; the fair task waits.
    h.tick_n(50);
    assert_eq!(h.sched.current_task(0).unwrap(), high);
}

#[test]
fn rr_tasks_rotate_on_slice_expiry() {
    let h = harness(1);

    let x = h.sched.create_task(20, "rr-x").unwrap();
    let y = h.sched.create_task(21, "rr-y").unwrap();
    for id in [x, y] {
        h.sched.set_policy(id, SchedPolicy::Rr).unwrap();
        h.sched.set_rt_priority(id, 30).unwrap();
        h.sched.wake_up(id).unwrap();
    }

    h.tick();
    let first = h.sched.current_task(0).unwrap();

    // The default RR slice is 100ms; after it expires the peer runs.
    h.tick_n(101);
    let second = h.sched.current_task(0).unwrap();
    assert_ne!(first, second);
    assert!(second == x || second == y);

    // And it rotates back again.
    h.tick_n(101);
    assert_eq!(h.sched.current_task(0).unwrap(), first);
}

#[test]
fn rt_bandwidth_throttles_to_fair() {
    let h = harness(1);

    let hog = h.sched.create_task(30, "rt-hog").unwrap();
    h.sched.set_policy(hog, SchedPolicy::Fifo).unwrap();
    h.sched.set_rt_priority(hog, 5).unwrap();
    let victim = h.sched.create_task(31, "victim").unwrap();
    h.sched.wake_up(hog).unwrap();
    h.sched.wake_up(victim).unwrap();

    // 950ms of a 1s period is the RT budget; once it is spent the fair
    // task gets the CPU until the period rolls over.
    h.tick_n(960);
    assert_eq!(h.sched.current_task(0).unwrap(), victim);
    assert!(h.sched.rq_snapshot(0).unwrap().rt_throttled);

    // After the period boundary the RT task is back.
    h.tick_n(100);
    assert_eq!(h.sched.current_task(0).unwrap(), hog);
}

#[test]
fn min_vruntime_is_monotone() {
    let h = harness(1);
    for i in 0..3 {
        let id = h.sched.create_task(40 + i, &format!("t{}", i)).unwrap();
        h.sched.wake_up(id).unwrap();
    }

    let mut last = 0u64;
    for _ in 0..200 {
        h.tick();
        let snap = h.sched.rq_snapshot(0).unwrap();
        assert!(snap.min_vruntime >= last);
        last = snap.min_vruntime;
    }
    assert!(last > 0);
}

#[test]
fn current_is_idle_when_nothing_runnable() {
    let h = harness(2);
    for cpu in 0..2 {
        let snap = h.sched.rq_snapshot(cpu).unwrap();
        assert_eq!(snap.current, snap.idle);
    }

    let t = h.sched.create_task(50, "sleeper").unwrap();
    h.sched.wake_up(t).unwrap();
    h.tick();
    let cpu = h.sched.task(t).unwrap().cpu();
    assert_eq!(h.sched.current_task(cpu).unwrap(), t);

    // Blocking it returns the CPU to idle.
    h.sched.set_state(t, TaskState::WaitInterruptible).unwrap();
    h.tick();
    let snap = h.sched.rq_snapshot(cpu).unwrap();
    assert_eq!(snap.current, snap.idle);

    // Waking it brings it back.
    h.sched.wake_up(t).unwrap();
    h.tick();
    assert_eq!(h.sched.current_task(cpu).unwrap(), t);
}

#[test]
fn destroy_while_current_recovers_to_idle() {
    let h = harness(1);
    let t = h.sched.create_task(60, "doomed").unwrap();
    h.sched.wake_up(t).unwrap();
    h.tick();
    assert_eq!(h.sched.current_task(0).unwrap(), t);

    h.sched.destroy_task(t).unwrap();
    h.tick();
    let snap = h.sched.rq_snapshot(0).unwrap();
    assert_eq!(snap.current, snap.idle);
    assert!(h.sched.task(t).is_err());
}

#[test]
fn wakeup_placement_prefers_least_loaded_cpu() {
    let h = harness(2);

    let busy = h.sched.create_task(70, "busy").unwrap();
    h.sched.set_affinity(busy, 0b01).unwrap();
    h.sched.wake_up(busy).unwrap();
    h.tick();
    assert_eq!(h.sched.current_task(0).unwrap(), busy);

    let newcomer = h.sched.create_task(71, "newcomer").unwrap();
    h.sched.wake_up(newcomer).unwrap();
    h.tick();
    assert_eq!(h.sched.task(newcomer).unwrap().cpu(), 1);
    assert_eq!(h.sched.current_task(1).unwrap(), newcomer);
}

#[test]
fn dispatcher_thread_runs_and_stops() {
    // Real clock and the actual dispatcher thread for the start/stop
    // contract.
    let sched = Arc::new(Scheduler::init(1).unwrap());
    let t = sched.create_task(80, "threaded").unwrap();
    sched.start().unwrap();
    sched.wake_up(t).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sched.current_task(0).unwrap(), t);

    sched.stop();
    // A second start after stop is allowed.
    sched.start().unwrap();
    sched.stop();
}
