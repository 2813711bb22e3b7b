//! Suspension directives yielded by step sources.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{ResourcePool, SchedulerError};
use crate::util::{to_chrono, to_std, Clock};

/// Retry hint reported for a task parked on a pool wait.
pub const POOL_RETRY_HINT: Duration = Duration::from_secs(1);

/// A request from a step source to pause without blocking a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspensionDirective {
    /// Resume once `since + duration` has passed.
    Sleep {
        /// When the sleep was requested.
        since: DateTime<Utc>,
        /// How long to sleep.
        duration: Duration,
    },
    /// Resume once every named pool can be acquired.
    PoolWait {
        /// Pool set acquired all-or-nothing for the following step.
        pool_names: Vec<String>,
    },
}

impl SuspensionDirective {
    /// Sleep for `duration` starting now.
    pub fn sleep(clock: &dyn Clock, duration: Duration) -> Self {
        Self::Sleep {
            since: clock.now(),
            duration,
        }
    }

    /// Wait for the given pool set.
    pub fn pools<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PoolWait {
            pool_names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a sleep has elapsed. Always false for pool waits.
    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        match self {
            Self::Sleep { since, duration } => clock.now() >= *since + to_chrono(*duration),
            Self::PoolWait { .. } => false,
        }
    }

    /// Whether a resume attempt would succeed right now.
    ///
    /// Pool waits are checked without acquiring, so a `true` here is only a
    /// hint; the driver still has to win the acquire.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownPool`] for unregistered pool names.
    pub fn is_ready(&self, pool: &ResourcePool, clock: &dyn Clock) -> Result<bool, SchedulerError> {
        match self {
            Self::Sleep { .. } => Ok(self.is_due(clock)),
            Self::PoolWait { pool_names } => pool.allow(pool_names),
        }
    }

    /// Time left until the directive could resolve.
    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        match self {
            Self::Sleep { since, duration } => to_std(*since + to_chrono(*duration) - clock.now()),
            Self::PoolWait { .. } => POOL_RETRY_HINT,
        }
    }
}
