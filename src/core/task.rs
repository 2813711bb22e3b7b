//! Step-by-step task driver.
//!
//! An [`IterationTask`] wraps a [`StepSource`] (a hand-rolled, possibly
//! infinite iterator over flow steps) and advances it one step per call to
//! [`IterationTask::step`]. Suspension directives yielded by the source are
//! resolved here against the [`ResourcePool`] and the [`Clock`]; the caller
//! only ever sees progress, "not ready" or completion.
//!
//! Pool occupancy is kept as short as possible: after a pool wait is won, the
//! very next step runs while the pools are held and they are released as soon
//! as that step returns. If that step suspends again, the pools stay held
//! until the nested suspension resolves.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::core::{PoolLease, ResourcePool, SchedulerError, SuspensionDirective};
use crate::util::{to_std, Clock};

/// Result of pulling one step from a [`StepSource`].
#[derive(Debug)]
pub enum StepResult {
    /// Plain progress value.
    Value(Value),
    /// Request to pause.
    Suspend(SuspensionDirective),
    /// The sequence is exhausted.
    Done,
    /// The sequence failed and must not be pulled again.
    Failed(SchedulerError),
}

/// A lazily evaluated sequence of flow steps.
pub trait StepSource: Send {
    /// Produce the next step.
    fn next_step(&mut self) -> StepResult;

    /// Called once when the driver gives up on the sequence because a
    /// deadline was violated. The source is never pulled again afterwards.
    fn abandon(&mut self, _reason: &SchedulerError) {}
}

impl<F> StepSource for F
where
    F: FnMut() -> StepResult + Send,
{
    fn next_step(&mut self) -> StepResult {
        self()
    }
}

/// What a single call to [`IterationTask::step`] achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A progress value was produced.
    Progress(Value),
    /// The task is parked on a directive; try again after roughly `wait`.
    NotReady {
        /// Hint for how long until the directive may resolve.
        wait: Duration,
    },
    /// The sequence is exhausted.
    Done,
}

#[derive(Debug)]
struct Parked {
    directive: SuspensionDirective,
    lease: Option<PoolLease>,
}

enum Resume {
    Continue(Option<PoolLease>),
    Park(Option<PoolLease>),
}

/// Drives one [`StepSource`] and enforces its deadlines.
pub struct IterationTask {
    id: Uuid,
    name: String,
    source: Box<dyn StepSource>,
    pool: Arc<ResourcePool>,
    clock: Arc<dyn Clock>,
    expires_at: Option<DateTime<Utc>>,
    soft_time_limit: Option<Duration>,
    iteration_count: u64,
    started_at: Option<DateTime<Utc>>,
    elapsed_last_step: Duration,
    parked: Option<Parked>,
    abandoned: bool,
}

impl fmt::Debug for IterationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expires_at", &self.expires_at)
            .field("soft_time_limit", &self.soft_time_limit)
            .field("iteration_count", &self.iteration_count)
            .field("parked", &self.parked)
            .finish_non_exhaustive()
    }
}

impl IterationTask {
    /// Wrap a step source.
    pub fn new(
        name: impl Into<String>,
        source: impl StepSource + 'static,
        pool: Arc<ResourcePool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source: Box::new(source),
            pool,
            clock,
            expires_at: None,
            soft_time_limit: None,
            iteration_count: 0,
            started_at: None,
            elapsed_last_step: Duration::ZERO,
            parked: None,
            abandoned: false,
        }
    }

    /// Set an absolute deadline.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Set the maximum duration of any single step.
    #[must_use]
    pub fn with_soft_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.soft_time_limit = limit;
        self
    }

    /// Unique task id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Display name, usually `<flow>:<period>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Number of calls to [`Self::step`] so far.
    #[must_use]
    pub const fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Duration of the most recent step.
    #[must_use]
    pub const fn elapsed_last_step(&self) -> Duration {
        self.elapsed_last_step
    }

    /// Time since the first step began.
    #[must_use]
    pub fn elapsed_since_start(&self) -> Duration {
        self.started_at
            .map_or(Duration::ZERO, |started| to_std(self.clock.now() - started))
    }

    /// Whether the task is parked on a directive.
    #[must_use]
    pub const fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    /// The parked directive, if any.
    #[must_use]
    pub fn parked_directive(&self) -> Option<&SuspensionDirective> {
        self.parked.as_ref().map(|p| &p.directive)
    }

    /// Whether calling [`Self::step`] may make progress.
    ///
    /// An unparked task is always ready. Pool errors count as ready so that the
    /// next step surfaces them.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.parked.as_ref().map_or(true, |p| {
            p.directive
                .is_ready(&self.pool, self.clock.as_ref())
                .unwrap_or(true)
        })
    }

    /// Whether the absolute deadline has passed.
    #[must_use]
    pub fn deadline_passed(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| self.clock.now() > expires_at)
    }

    /// Time until the parked directive may resolve.
    #[must_use]
    pub fn remaining_wait(&self) -> Duration {
        self.parked
            .as_ref()
            .map_or(Duration::ZERO, |p| p.directive.remaining(self.clock.as_ref()))
    }

    /// Advance the task by one step.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Expired`] or
    /// [`SchedulerError::SoftTimeLimitExceeded`] when a deadline is violated,
    /// and any error the step source fails with. All errors are terminal; on a
    /// deadline violation the source is told through [`StepSource::abandon`].
    pub fn step(&mut self) -> Result<StepOutcome, SchedulerError> {
        self.check_limits().map_err(|err| self.abandon(err))?;

        let before = self.clock.now();
        self.started_at.get_or_insert(before);
        let outcome = self.advance();
        self.elapsed_last_step = to_std(self.clock.now() - before);
        self.iteration_count += 1;

        let outcome = outcome?;
        self.check_limits().map_err(|err| self.abandon(err))?;
        trace!(task = %self.name, iteration = self.iteration_count, ?outcome, "task stepped");
        Ok(outcome)
    }

    /// Drive the task to the end, sleeping inline whenever it is parked.
    ///
    /// Used for manual and synchronous execution outside the executor.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by [`Self::step`].
    pub fn run_to_completion(&mut self) -> Result<Vec<Value>, SchedulerError> {
        let mut values = Vec::new();
        loop {
            match self.step()? {
                StepOutcome::Progress(value) => values.push(value),
                StepOutcome::NotReady { wait } => self.clock.sleep(wait),
                StepOutcome::Done => return Ok(values),
            }
        }
    }

    fn abandon(&mut self, reason: SchedulerError) -> SchedulerError {
        self.parked = None;
        if !std::mem::replace(&mut self.abandoned, true) {
            self.source.abandon(&reason);
        }
        reason
    }

    fn check_limits(&self) -> Result<(), SchedulerError> {
        if let Some(expires_at) = self.expires_at {
            if self.clock.now() > expires_at {
                return Err(SchedulerError::Expired { expires_at });
            }
        }
        if let Some(limit) = self.soft_time_limit {
            if self.elapsed_last_step > limit {
                return Err(SchedulerError::SoftTimeLimitExceeded {
                    limit,
                    elapsed: self.elapsed_last_step,
                });
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<StepOutcome, SchedulerError> {
        let lease = match self.parked.take() {
            None => None,
            Some(Parked { directive, lease }) => match self.resume(&directive, lease)? {
                Resume::Continue(lease) => lease,
                Resume::Park(lease) => return Ok(self.park(directive, lease)),
            },
        };
        self.pull(lease)
    }

    /// Pull steps until one produces something the caller must see.
    ///
    /// `lease` is released when the pulled step returns a value, completes or
    /// fails.
    fn pull(&mut self, mut lease: Option<PoolLease>) -> Result<StepOutcome, SchedulerError> {
        loop {
            match self.source.next_step() {
                StepResult::Value(value) => return Ok(StepOutcome::Progress(value)),
                StepResult::Done => return Ok(StepOutcome::Done),
                StepResult::Failed(err) => return Err(err),
                StepResult::Suspend(directive) => match self.resume(&directive, lease.take())? {
                    Resume::Continue(next) => lease = next,
                    Resume::Park(held) => return Ok(self.park(directive, held)),
                },
            }
        }
    }

    fn resume(
        &self,
        directive: &SuspensionDirective,
        held: Option<PoolLease>,
    ) -> Result<Resume, SchedulerError> {
        match directive {
            SuspensionDirective::Sleep { .. } => {
                if directive.is_due(self.clock.as_ref()) {
                    drop(held);
                    Ok(Resume::Continue(None))
                } else {
                    Ok(Resume::Park(held))
                }
            }
            SuspensionDirective::PoolWait { pool_names } => match self.pool.try_lease(pool_names)? {
                Some(acquired) => {
                    drop(held);
                    Ok(Resume::Continue(Some(acquired)))
                }
                None => Ok(Resume::Park(held)),
            },
        }
    }

    fn park(&mut self, directive: SuspensionDirective, lease: Option<PoolLease>) -> StepOutcome {
        let wait = directive.remaining(self.clock.as_ref());
        self.parked = Some(Parked { directive, lease });
        StepOutcome::NotReady { wait }
    }
}
