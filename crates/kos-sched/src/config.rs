//! Scheduler configuration and tunables

use std::time::Duration;

use kos_core::error::{KernelError, KernelResult};

/// Upper bound on supported CPUs (affinity masks are one word)
pub const MAX_CPUS: usize = 64;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of simulated CPUs
    pub nr_cpus: usize,

    /// Target period in which every fair task runs once (default: 6ms)
    pub sched_latency: Duration,

    /// Minimum slice a fair task receives (default: 1.5ms)
    pub min_granularity: Duration,

    /// Preemption hysteresis for wakeups (default: 2ms)
    pub wakeup_granularity: Duration,

    /// Dispatcher pass cadence (default: 1ms)
    pub tick_interval: Duration,

    /// Load balance period (default: 100ms)
    pub balance_interval: Duration,

    /// Migration batch cap per balance pass (default: 32)
    pub nr_migrate: usize,

    /// RT bandwidth accounting period (default: 1s)
    pub rt_period: Duration,

    /// RT runtime allowed inside one period (default: 950ms)
    pub rt_runtime: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            sched_latency: Duration::from_millis(6),
            min_granularity: Duration::from_micros(1500),
            wakeup_granularity: Duration::from_millis(2),
            tick_interval: Duration::from_millis(1),
            balance_interval: Duration::from_millis(100),
            nr_migrate: 32,
            rt_period: Duration::from_secs(1),
            rt_runtime: Duration::from_millis(950),
        }
    }
}

impl SchedConfig {
    pub fn new(nr_cpus: usize) -> Self {
        Self { nr_cpus, ..Default::default() }
    }

    pub fn sched_latency(mut self, d: Duration) -> Self {
        self.sched_latency = d;
        self
    }

    pub fn min_granularity(mut self, d: Duration) -> Self {
        self.min_granularity = d;
        self
    }

    pub fn wakeup_granularity(mut self, d: Duration) -> Self {
        self.wakeup_granularity = d;
        self
    }

    pub fn balance_interval(mut self, d: Duration) -> Self {
        self.balance_interval = d;
        self
    }

    pub fn nr_migrate(mut self, n: usize) -> Self {
        self.nr_migrate = n;
        self
    }

    pub fn rt_bandwidth(mut self, period: Duration, runtime: Duration) -> Self {
        self.rt_period = period;
        self.rt_runtime = runtime;
        self
    }

    /// Apply a named tunable (nanosecond/millisecond units as the name
    /// states); unknown names are rejected
    pub fn apply_tunable(&mut self, name: &str, value: u64) -> KernelResult<()> {
        match name {
            "sched_latency_ns" => self.sched_latency = Duration::from_nanos(value),
            "sched_min_granularity_ns" => self.min_granularity = Duration::from_nanos(value),
            "sched_wakeup_granularity_ns" => self.wakeup_granularity = Duration::from_nanos(value),
            "balance_interval_ms" => self.balance_interval = Duration::from_millis(value),
            "nr_migrate" => self.nr_migrate = value as usize,
            "rt_period_ns" => self.rt_period = Duration::from_nanos(value),
            "rt_runtime_ns" => self.rt_runtime = Duration::from_nanos(value),
            _ => return Err(KernelError::InvalidArgument),
        }
        Ok(())
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(KernelError::InvalidArgument);
        }
        if self.sched_latency.is_zero()
            || self.min_granularity.is_zero()
            || self.tick_interval.is_zero()
        {
            return Err(KernelError::InvalidArgument);
        }
        if self.min_granularity > self.sched_latency {
            return Err(KernelError::InvalidArgument);
        }
        if self.rt_runtime > self.rt_period {
            return Err(KernelError::InvalidArgument);
        }
        if self.nr_migrate == 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(SchedConfig::new(4).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(SchedConfig::new(0).validate().is_err());
        assert!(SchedConfig::new(MAX_CPUS + 1).validate().is_err());

        let bad = SchedConfig::new(2).rt_bandwidth(
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tunables() {
        let mut cfg = SchedConfig::new(2);
        cfg.apply_tunable("sched_latency_ns", 12_000_000).unwrap();
        assert_eq!(cfg.sched_latency, Duration::from_millis(12));
        cfg.apply_tunable("balance_interval_ms", 250).unwrap();
        assert_eq!(cfg.balance_interval, Duration::from_millis(250));
        assert_eq!(
            cfg.apply_tunable("bogus", 1).err(),
            Some(KernelError::InvalidArgument)
        );
    }
}
