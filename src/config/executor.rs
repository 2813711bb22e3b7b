//! Executor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_workers() -> usize {
    num_cpus::get()
}

const fn default_tick_interval_ms() -> u64 {
    1_000
}

const fn default_order_interval_ms() -> u64 {
    15_000
}

const fn default_wake_poll_ms() -> u64 {
    1_000
}

/// Worker and scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Cadence of the scheduler loop, which wakes parked tasks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Cadence of the ordering function; a multiple of the tick in practice.
    #[serde(default = "default_order_interval_ms")]
    pub order_interval_ms: u64,
    /// How long an idle worker waits on the woken queue before polling `ready`.
    #[serde(default = "default_wake_poll_ms")]
    pub wake_poll_ms: u64,
    /// Stop ordering after this many order ticks.
    #[serde(default)]
    pub max_orders: Option<u32>,
    /// Only order flows that write nowhere.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_interval_ms: default_tick_interval_ms(),
            order_interval_ms: default_order_interval_ms(),
            wake_poll_ms: default_wake_poll_ms(),
            max_orders: None,
            dry_run: false,
        }
    }
}

impl ExecutorConfig {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the scheduler tick.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = millis(interval);
        self
    }

    /// Set the ordering cadence.
    #[must_use]
    pub fn with_order_interval(mut self, interval: Duration) -> Self {
        self.order_interval_ms = millis(interval);
        self
    }

    /// Set the worker short-poll.
    #[must_use]
    pub fn with_wake_poll(mut self, poll: Duration) -> Self {
        self.wake_poll_ms = millis(poll);
        self
    }

    /// Limit the number of order ticks.
    #[must_use]
    pub const fn with_max_orders(mut self, max_orders: Option<u32>) -> Self {
        self.max_orders = max_orders;
        self
    }

    /// Toggle dry-run mode. Dry runs do not short-poll the woken queue.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        if dry_run {
            self.wake_poll_ms = 0;
        }
        self
    }

    /// Scheduler tick.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Ordering cadence.
    #[must_use]
    pub const fn order_interval(&self) -> Duration {
        Duration::from_millis(self.order_interval_ms)
    }

    /// Worker short-poll.
    #[must_use]
    pub const fn wake_poll(&self) -> Duration {
        Duration::from_millis(self.wake_poll_ms)
    }

    /// Validate executor settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be greater than 0".into());
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        if self.order_interval_ms < self.tick_interval_ms {
            return Err("order_interval_ms must not be shorter than tick_interval_ms".into());
        }
        Ok(())
    }

    /// Parse executor configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
