//! Flow ledger: one row per `(flow, period)` recording execution state.
//!
//! Backends implement [`LedgerStore`]. Every mutating call takes `now`
//! explicitly so `updated_at` follows the engine clock rather than the wall
//! clock.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::LedgerError;
use crate::util::to_chrono;

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

/// Execution status of one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Due and waiting to be ordered.
    Add,
    /// Ordered and owned by a task.
    Run,
    /// Finished successfully.
    Success,
    /// Failed; eligible for retry.
    Error,
    /// Failed; counted toward the circuit breaker.
    FatalError,
}

impl FlowStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [Self::Add, Self::Run, Self::Success, Self::Error, Self::FatalError];

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Run => "RUN",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::FatalError => "FATAL_ERROR",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown status '{s}'")))
    }
}

/// Pipeline stage a running period is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EtlStep {
    /// Reading from the provider.
    Export,
    /// Validating and shaping rows.
    Transform,
    /// Writing to storage.
    Load,
}

impl EtlStep {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Export => "EXPORT",
            Self::Transform => "TRANSFORM",
            Self::Load => "LOAD",
        }
    }
}

impl FromStr for EtlStep {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXPORT" => Ok(Self::Export),
            "TRANSFORM" => Ok(Self::Transform),
            "LOAD" => Ok(Self::Load),
            other => Err(LedgerError::Corrupt(format!("unknown etl step '{other}'"))),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Flow name.
    pub flow_name: String,
    /// Period start.
    pub period: DateTime<Utc>,
    /// Current status.
    pub status: FlowStatus,
    /// Stage the period is in while running.
    pub etl_step: Option<EtlStep>,
    /// Automatic retries so far.
    pub retries: u32,
    /// Run time in seconds of the last attempt.
    pub duration: Option<i64>,
    /// Last error or note.
    pub info: Option<String>,
    /// Log file of the last attempt.
    pub log_path: Option<String>,
    /// Deadline after which the period is no longer executed.
    pub expires_at: Option<DateTime<Utc>>,
    /// Start of the last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the last attempt.
    pub finished_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Fingerprint of the flow configuration that last touched the row.
    pub config_hash: String,
    /// Stage-reported context, opaque to the engine.
    pub payload: Value,
}

impl FlowEntry {
    /// Fresh row in the given status.
    pub fn new(
        flow_name: impl Into<String>,
        period: DateTime<Utc>,
        status: FlowStatus,
        config_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_name: flow_name.into(),
            period,
            status,
            etl_step: None,
            retries: 0,
            duration: None,
            info: None,
            log_path: None,
            expires_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            config_hash: config_hash.into(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

/// Partial update of a ledger row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryUpdate {
    /// New status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FlowStatus>,
    /// New stage; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub etl_step: Option<Option<EtlStep>>,
    /// New info; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub info: Option<Option<String>>,
    /// New retry count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Run time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Log file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// Attempt start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Attempt end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Configuration fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    /// Replacement payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EntryUpdate {
    /// Update that only sets the status.
    #[must_use]
    pub fn status(status: FlowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the update to a row and stamp `updated_at`.
    pub fn apply_to(&self, entry: &mut FlowEntry, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(etl_step) = self.etl_step {
            entry.etl_step = etl_step;
        }
        if let Some(info) = &self.info {
            entry.info.clone_from(info);
        }
        if let Some(retries) = self.retries {
            entry.retries = retries;
        }
        if let Some(duration) = self.duration {
            entry.duration = Some(duration);
        }
        if let Some(log_path) = &self.log_path {
            entry.log_path = Some(log_path.clone());
        }
        if let Some(started_at) = self.started_at {
            entry.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            entry.finished_at = Some(finished_at);
        }
        if let Some(config_hash) = &self.config_hash {
            entry.config_hash.clone_from(config_hash);
        }
        if let Some(payload) = &self.payload {
            entry.payload = payload.clone();
        }
        entry.updated_at = now;
    }
}

/// Serde helper keeping `Some(None)` distinct from `None` as JSON `null`.
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::option_option)]
    pub fn serialize<T: Serialize, S: Serializer>(value: &Option<Option<T>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(s),
            None => s.serialize_none(),
        }
    }

    #[allow(clippy::option_option)]
    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(d: D) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(d).map(Some)
    }
}

/// Inclusive period filter. Open ends match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodRange {
    /// Lower bound, inclusive.
    pub from: Option<DateTime<Utc>>,
    /// Upper bound, inclusive.
    pub to: Option<DateTime<Utc>>,
}

impl PeriodRange {
    /// Every period.
    #[must_use]
    pub const fn all() -> Self {
        Self { from: None, to: None }
    }

    /// Periods between `from` and `to`, inclusive.
    #[must_use]
    pub const fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Whether `period` lies inside the range.
    #[must_use]
    pub fn contains(&self, period: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| period >= from) && self.to.map_or(true, |to| period <= to)
    }
}

/// Counts returned by [`LedgerStore::clear_lost_entries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LostEntries {
    /// `RUN` rows moved back to `ADD`.
    pub reverted: usize,
    /// Expired `ADD`/`RUN` rows moved to `ERROR`.
    pub expired: usize,
}

/// Info stamped on rows that expired before they could run.
pub const EXPIRED_INFO: &str = "expired";

/// Latest `finished_at` whose retry delay has elapsed at `now`.
///
/// `None` when `now - delay` is out of range: no finished row is ready then.
pub(crate) fn retry_cutoff(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(to_chrono(delay))
}

/// Storage backend for the flow ledger.
///
/// Implementations must serialize writes; every multi-row operation is
/// atomic with respect to other calls.
pub trait LedgerStore: Send + Sync {
    /// Insert a row unless `(flow, period)` already exists. Returns whether a
    /// row was inserted.
    fn create(&self, entry: &FlowEntry) -> Result<bool, LedgerError>;

    /// Fetch one row.
    fn get(&self, flow: &str, period: DateTime<Utc>) -> Result<Option<FlowEntry>, LedgerError>;

    /// Row with the earliest period.
    fn first_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError>;

    /// Row with the latest period.
    fn last_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError>;

    /// The `limit` most recently updated rows, newest first. Ties are broken
    /// by latest period.
    fn recently_updated(&self, flow: &str, limit: usize) -> Result<Vec<FlowEntry>, LedgerError>;

    /// Rows ordered by period, newest first. An empty `statuses` matches all.
    fn list(
        &self,
        flow: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<FlowEntry>, LedgerError>;

    /// Number of rows in the given statuses. An empty `statuses` matches all.
    fn count(&self, flow: &str, statuses: &[FlowStatus]) -> Result<usize, LedgerError>;

    /// Names of every flow with at least one row.
    fn flows(&self) -> Result<Vec<String>, LedgerError>;

    /// Delete rows in a range.
    fn delete(&self, flow: &str, range: &PeriodRange) -> Result<usize, LedgerError>;

    /// Delete specific periods.
    fn delete_periods(&self, flow: &str, periods: &[DateTime<Utc>]) -> Result<usize, LedgerError>;

    /// Set the status of rows in `range` whose status is in `filter` (empty
    /// filter matches all).
    fn set_status(
        &self,
        flow: &str,
        status: FlowStatus,
        filter: &[FlowStatus],
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError>;

    /// Set or clear the deadline of rows in `range`.
    fn set_expiry(
        &self,
        flow: &str,
        expires_at: Option<DateTime<Utc>>,
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError>;

    /// Apply a partial update to specific periods.
    fn apply_update(
        &self,
        flow: &str,
        periods: &[DateTime<Utc>],
        update: &EntryUpdate,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError>;

    /// Move retryable `ERROR` rows back to `ADD` and bump their retry count in
    /// one atomic operation. Returns the retried periods.
    ///
    /// A row is retryable when `retries < max_retries`, its backoff has
    /// elapsed (`finished_at` unset or `finished_at + retry_delay <= now`) and
    /// it has not expired.
    fn retry_errors(
        &self,
        flow: &str,
        max_retries: u32,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError>;

    /// Move `FATAL_ERROR` rows stamped with a different hash back to `ADD`,
    /// resetting retries and expiry and stamping the new hash.
    fn reset_fatal(&self, flow: &str, config_hash: &str, now: DateTime<Utc>) -> Result<usize, LedgerError>;

    /// Recover from a crash: `RUN` rows go back to `ADD`, then expired
    /// `ADD`/`RUN` rows become `ERROR`.
    fn clear_lost_entries(&self, now: DateTime<Utc>) -> Result<LostEntries, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in FlowStatus::ALL {
            assert_eq!(status.as_str().parse::<FlowStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<FlowStatus>().is_err());
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let update = EntryUpdate {
            status: Some(FlowStatus::Success),
            etl_step: Some(None),
            ..EntryUpdate::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({"status": "SUCCESS", "etl_step": null}));
        let back: EntryUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn test_apply_to_stamps_updated_at() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let mut entry = FlowEntry::new("f", t0, FlowStatus::Add, "h", t0);
        entry.info = Some("old".into());
        EntryUpdate {
            status: Some(FlowStatus::Run),
            info: Some(None),
            ..EntryUpdate::default()
        }
        .apply_to(&mut entry, t1);
        assert_eq!(entry.status, FlowStatus::Run);
        assert_eq!(entry.info, None);
        assert_eq!(entry.updated_at, t1);
        assert_eq!(entry.created_at, t0);
    }

    #[test]
    fn test_period_range_bounds_are_inclusive() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let range = PeriodRange::between(a, b);
        assert!(range.contains(a));
        assert!(range.contains(b));
        assert!(!range.contains(b + chrono::Duration::seconds(1)));
        assert!(PeriodRange::all().contains(a));
    }
}
