//! Due-work calculation for one flow.
//!
//! [`DueWork::get_due_entries`] brings the ledger up to date with the
//! schedule (bootstrap, advance, stale-data recomputation, gap filling,
//! retries) and returns the periods that are ready to be ordered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{ScheduleSpec, SchedulerError};
use crate::infra::ledger::{FlowEntry, FlowStatus, LedgerStore};

/// Which prior periods to recompute whenever a new period is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackfillOffsets {
    /// The `n` periods immediately before the new one.
    Count(u32),
    /// Explicit offsets relative to the new period. Non-negative values are ignored.
    Offsets(Vec<i64>),
}

impl BackfillOffsets {
    /// Negative offsets, nearest first.
    #[must_use]
    pub fn offsets(&self) -> Vec<i64> {
        match self {
            Self::Count(n) => (1..=i64::from(*n)).map(|k| -k).collect(),
            Self::Offsets(list) => {
                let mut offsets: Vec<i64> = list.iter().copied().filter(|k| *k < 0).collect();
                offsets.sort_unstable_by(|a, b| b.cmp(a));
                offsets.dedup();
                offsets
            }
        }
    }
}

/// Everything the calculator needs to know about one flow.
#[derive(Debug, Clone)]
pub struct DueWork {
    /// Flow name.
    pub flow: String,
    /// Schedule of the flow.
    pub schedule: ScheduleSpec,
    /// Fingerprint of the current flow configuration.
    pub config_hash: String,
    /// Maximum automatic retries of an `ERROR` period.
    pub retries: u32,
    /// Minimum time between a failure and its retry.
    pub retry_delay: Duration,
    /// Consecutive fatal errors that stop scheduling; `0` disables the breaker.
    pub max_fatal_errors: u32,
    /// Prior periods to recompute when a new period appears.
    pub backfill: Option<BackfillOffsets>,
}

impl DueWork {
    /// Update the ledger for `now` and return the due periods, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Schedule`] if `now` cannot be mapped onto the
    /// schedule and [`SchedulerError::Ledger`] on storage failures.
    pub fn get_due_entries(
        &self,
        ledger: &dyn LedgerStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowEntry>, SchedulerError> {
        let now_period = self.schedule.current_period(now)?;
        self.get_due_entries_at(ledger, now_period, now)
    }

    /// Same as [`Self::get_due_entries`] with an explicit current period.
    ///
    /// # Errors
    ///
    /// See [`Self::get_due_entries`].
    pub fn get_due_entries_at(
        &self,
        ledger: &dyn LedgerStore,
        now_period: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowEntry>, SchedulerError> {
        if self.circuit_open(ledger, now)? {
            return Ok(Vec::new());
        }

        match ledger.last_entry(&self.flow)? {
            None => {
                self.create(ledger, now_period, now)?;
                info!(flow = %self.flow, period = %now_period, "created first period");
            }
            Some(last) => {
                let next = self.schedule.next_period(last.period)?;
                if next <= now_period && self.create(ledger, next, now)? {
                    info!(flow = %self.flow, period = %next, "created next period");
                    self.recreate_previous(ledger, next, now)?;
                }
            }
        }

        if self.schedule.keep_sequence() {
            self.fill_gaps(ledger, now_period, now)?;
        }

        let retried = ledger.retry_errors(&self.flow, self.retries, self.retry_delay, now)?;
        if !retried.is_empty() {
            info!(flow = %self.flow, count = retried.len(), "periods scheduled for retry");
        }

        let due: Vec<FlowEntry> = ledger
            .list(&self.flow, &[FlowStatus::Add], None, 0)?
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .collect();
        debug!(flow = %self.flow, due = due.len(), "due periods computed");
        Ok(due)
    }

    /// Circuit breaker check. A config change reopens scheduling by moving
    /// stale fatal periods back to `ADD`.
    fn circuit_open(&self, ledger: &dyn LedgerStore, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let window = usize::try_from(self.max_fatal_errors).unwrap_or(usize::MAX).max(1);
        let recent = ledger.recently_updated(&self.flow, window)?;
        let Some(latest) = recent.first() else {
            return Ok(false);
        };

        if latest.config_hash != self.config_hash {
            let reset = ledger.reset_fatal(&self.flow, &self.config_hash, now)?;
            if reset > 0 {
                info!(flow = %self.flow, count = reset, "configuration changed, fatal periods reset");
            }
            return Ok(false);
        }

        let open = self.max_fatal_errors > 0
            && recent.len() >= window
            && recent.iter().all(|entry| entry.status == FlowStatus::FatalError);
        if open {
            warn!(
                flow = %self.flow,
                max_fatal_errors = self.max_fatal_errors,
                "too many fatal errors, flow is not scheduled until its configuration changes"
            );
        }
        Ok(open)
    }

    fn create(&self, ledger: &dyn LedgerStore, period: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let entry = FlowEntry::new(&self.flow, period, FlowStatus::Add, &self.config_hash, now);
        Ok(ledger.create(&entry)?)
    }

    /// Delete and recreate prior periods so late upstream data is reprocessed.
    fn recreate_previous(
        &self,
        ledger: &dyn LedgerStore,
        new_period: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(backfill) = &self.backfill else {
            return Ok(());
        };
        let Some(first) = ledger.first_entry(&self.flow)? else {
            return Ok(());
        };

        let mut periods = Vec::new();
        for offset in backfill.offsets() {
            let period = self.schedule.shift(new_period, offset)?;
            if period >= first.period {
                periods.push(period);
            }
        }
        if periods.is_empty() {
            return Ok(());
        }

        ledger.delete_periods(&self.flow, &periods)?;
        for period in &periods {
            self.create(ledger, *period, now)?;
        }
        info!(flow = %self.flow, count = periods.len(), "recreated previous periods");
        Ok(())
    }

    fn fill_gaps(&self, ledger: &dyn LedgerStore, now_period: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let mut created = 0usize;
        for period in self.schedule.periods_between(self.schedule.anchor(), now_period)? {
            if self.create(ledger, period, now)? {
                created += 1;
            }
        }
        if created > 0 {
            info!(flow = %self.flow, count = created, "backfilled missing periods");
        }
        Ok(())
    }
}
