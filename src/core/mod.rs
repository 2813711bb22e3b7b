//! Core scheduling abstractions: pools, suspension, task driver, executor,
//! schedules and due-work calculation.

pub mod directive;
pub mod error;
pub mod executor;
pub mod pool;
pub mod schedule;
pub mod task;
pub mod work;

pub use directive::{SuspensionDirective, POOL_RETRY_HINT};
pub use error::{AppResult, LedgerError, SchedulerError, StageError};
pub use executor::{Executor, ExecutorStats, TaskOrderer};
pub use pool::{PoolLease, PoolUsage, ResourcePool};
pub use schedule::{localize, Interval, PeriodWindow, ScheduleSpec};
pub use task::{IterationTask, StepOutcome, StepResult, StepSource};
pub use work::{BackfillOffsets, DueWork};
