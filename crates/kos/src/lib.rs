//! # kos
//!
//! The kernel façade: one owned value wiring together the network stack
//! (`kos-net`), the multi-class scheduler (`kos-sched`) and the shared
//! timer worker (`kos-core`). There is no implicit global state; a
//! [`Kernel`] is initialized explicitly and shut down deterministically,
//! releasing every worker it started.
//!
//! ```no_run
//! use kos::{Kernel, KernelConfig};
//!
//! let kernel = Kernel::init(KernelConfig::default()).unwrap();
//! kernel.start().unwrap();
//! // ... create interfaces, sockets, tasks ...
//! kernel.shutdown();
//! ```

use std::sync::{Arc, Mutex};

use kos_core::clock::Clock;
use kos_core::error::KernelResult;
use kos_core::timer::{TimerWorker, TimerWorkerConfig};
use kos_net::NetStack;
use kos_sched::{SchedConfig, Scheduler};

pub mod logger;

// Re-exports: the whole surface hangs off these
pub use kos_core::{
    ByteReader, ByteWriter, KernelError, Layer, PacketBuffer, SocketId, TaskId,
};
pub use kos_net::{
    Hook, LinkDriver, MacAddr, NetInterface, NetfilterHandler, OptVal, PacketMeta, Verdict,
};
pub use kos_sched::{RqSnapshot, SchedPolicy, TaskState};

/// Kernel construction parameters
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Scheduler shape and tunables
    pub sched: SchedConfig,

    /// Timer worker cadence
    pub timer: TimerWorkerConfig,

    /// Use a manually advanced clock (simulation and tests)
    pub manual_clock: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            sched: SchedConfig::new(1),
            timer: TimerWorkerConfig::default(),
            manual_clock: false,
        }
    }
}

/// The kernel
pub struct Kernel {
    pub clock: Arc<Clock>,
    pub net: Arc<NetStack>,
    pub sched: Arc<Scheduler>,
    timer: Mutex<Option<TimerWorker>>,
    timer_config: TimerWorkerConfig,
}

impl Kernel {
    /// Build the subsystems; nothing runs until [`Kernel::start`]
    pub fn init(config: KernelConfig) -> KernelResult<Kernel> {
        config.timer.validate().map_err(|msg| {
            log::error!("invalid timer config: {}", msg);
            kos_core::KernelError::InvalidArgument
        })?;
        let clock = Arc::new(if config.manual_clock {
            Clock::manual()
        } else {
            Clock::system()
        });
        let net = Arc::new(NetStack::new(clock.clone()));
        let sched = Arc::new(Scheduler::with_config(config.sched, clock.clone())?);

        Ok(Kernel {
            clock,
            net,
            sched,
            timer: Mutex::new(None),
            timer_config: config.timer,
        })
    }

    /// Start the dispatcher and the timer worker
    pub fn start(&self) -> KernelResult<()> {
        self.sched.start()?;
        let worker = TimerWorker::spawn(
            self.clock.clone(),
            self.net.sweeps(),
            self.timer_config.clone(),
        );
        *self.timer.lock().unwrap() = Some(worker);
        log::debug!("kernel started");
        Ok(())
    }

    /// Stop the workers and tear the subsystems down
    ///
    /// The timer worker goes first so no sweep races the stack
    /// teardown; then the dispatcher, then the stack itself.
    pub fn shutdown(&self) {
        if let Some(worker) = self.timer.lock().unwrap().take() {
            let stats = worker.shutdown();
            log::debug!("timer worker ran {} rounds", stats.rounds);
        }
        self.sched.stop();
        self.net.shutdown();
        log::debug!("kernel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_init_start_shutdown() {
        let kernel = Kernel::init(KernelConfig::default()).unwrap();
        kernel.start().unwrap();

        let task = kernel.sched.create_task(1, "worker").unwrap();
        kernel.sched.wake_up(task).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(kernel.sched.current_task(0).unwrap(), task);

        kernel.shutdown();
    }

    #[test]
    fn test_manual_clock_config() {
        let config = KernelConfig {
            manual_clock: true,
            ..Default::default()
        };
        let kernel = Kernel::init(config).unwrap();
        assert!(kernel.clock.is_manual());
        kernel.clock.advance(Duration::from_secs(5));
        assert_eq!(kernel.clock.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_timer_config_rejected() {
        let config = KernelConfig {
            timer: kos_core::timer::TimerWorkerConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Kernel::init(config).is_err());
    }
}
