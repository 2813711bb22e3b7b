//! Flow definitions ("notebooks").
//!
//! A notebook is a JSON document naming the provider and storage of a flow,
//! its schedule and its retry policy. Stage sections carry pools, an
//! optional concurrency cap and free-form parameters for the stage itself.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::{BackfillOffsets, DueWork, Interval, ScheduleSpec, SchedulerError};

/// File suffix of notebooks in the notebooks directory.
pub const NOTEBOOK_SUFFIX: &str = ".flow.json";

const fn default_period_length() -> usize {
    1
}

const fn default_retry_delay() -> u64 {
    60
}

const fn default_max_fatal_errors() -> u32 {
    3
}

/// Schedule section of a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePolicy {
    /// Seconds, `"hourly"` or `"daily"`.
    pub interval: Interval,
    /// IANA timezone name.
    pub timezone: String,
    /// `HH:MM[:SS]` or a local datetime.
    pub start_time: String,
    /// First period to backfill from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<NaiveDate>,
    /// Periods batched into one run.
    #[serde(default = "default_period_length")]
    pub period_length: usize,
    /// Whether missing periods are backfilled.
    #[serde(default)]
    pub keep_sequence: bool,
}

/// Work section of a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPolicy {
    /// Schedule.
    pub schedule: SchedulePolicy,
    /// Pools held by every stage.
    #[serde(default)]
    pub pools: Vec<String>,
    /// Cap on concurrently running stages of this flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Automatic retries of an `ERROR` period.
    #[serde(default)]
    pub retries: u32,
    /// Seconds between a failure and its retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Consecutive fatal errors that stop scheduling; `0` disables the check.
    #[serde(default = "default_max_fatal_errors")]
    pub max_fatal_errors: u32,
    /// Maximum duration of a single step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_time_limit_seconds: Option<u64>,
    /// Deadline of a run, counted from the end of its window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_seconds_from_worktime: Option<u64>,
    /// Prior periods recomputed when a new period appears.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_stale_data: Option<BackfillOffsets>,
}

/// One of the export, transform or load sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Pools held while this stage runs.
    #[serde(default)]
    pub pools: Vec<String>,
    /// Cap on concurrent executions of this stage across runs of the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Stage parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Validated flow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    /// Flow name; defaults to the file name without its suffix.
    #[serde(default)]
    pub name: String,
    /// Export provider key.
    pub provider: String,
    /// Load storage key.
    pub storage: String,
    /// Scheduling and retry policy.
    pub work: WorkPolicy,
    /// Export section.
    #[serde(default)]
    pub export: StagePolicy,
    /// Transform section.
    #[serde(default)]
    pub transform: StagePolicy,
    /// Load section.
    #[serde(default)]
    pub load: StagePolicy,
}

impl Notebook {
    /// Parse and validate a notebook.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let notebook: Self = serde_json::from_str(input).map_err(|e| e.to_string())?;
        notebook.validate()?;
        Ok(notebook)
    }

    /// Read a notebook file. An empty `name` is taken from the file name.
    pub fn load(path: &Path) -> Result<Self, String> {
        let body = std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        let mut notebook: Self = serde_json::from_str(&body).map_err(|e| format!("{}: {e}", path.display()))?;
        if notebook.name.is_empty() {
            notebook.name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.trim_end_matches(NOTEBOOK_SUFFIX).to_string())
                .unwrap_or_default();
        }
        notebook.validate().map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(notebook)
    }

    /// Validate the notebook.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".into());
        }
        if self.provider.is_empty() || self.storage.is_empty() {
            return Err("provider and storage are required".into());
        }
        for (section, policy) in self.stages() {
            if policy.concurrency == Some(0) {
                return Err(format!("{section}.concurrency must be greater than 0"));
            }
        }
        if self.work.concurrency == Some(0) {
            return Err("work.concurrency must be greater than 0".into());
        }
        if self.work.soft_time_limit_seconds == Some(0) {
            return Err("work.soft_time_limit_seconds must be greater than 0".into());
        }
        self.schedule_spec().map(|_| ()).map_err(|e| e.to_string())
    }

    /// The three stage sections with their names.
    #[must_use]
    pub fn stages(&self) -> [(&'static str, &StagePolicy); 3] {
        [("export", &self.export), ("transform", &self.transform), ("load", &self.load)]
    }

    /// Fingerprint of the effective configuration.
    #[must_use]
    pub fn config_hash(&self) -> String {
        let body = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(body))
    }

    /// Build the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Schedule`] for an unknown timezone or an
    /// invalid schedule.
    pub fn schedule_spec(&self) -> Result<ScheduleSpec, SchedulerError> {
        let policy = &self.work.schedule;
        let timezone: Tz = policy
            .timezone
            .parse()
            .map_err(|_| SchedulerError::Schedule(format!("unknown timezone '{}'", policy.timezone)))?;
        ScheduleSpec::new(
            policy.interval,
            timezone,
            &policy.start_time,
            policy.from_date,
            policy.period_length,
            policy.keep_sequence,
        )
    }

    /// Due-work calculator for this flow.
    ///
    /// # Errors
    ///
    /// See [`Self::schedule_spec`].
    pub fn due_work(&self) -> Result<DueWork, SchedulerError> {
        Ok(DueWork {
            flow: self.name.clone(),
            schedule: self.schedule_spec()?,
            config_hash: self.config_hash(),
            retries: self.work.retries,
            retry_delay: Duration::from_secs(self.work.retry_delay),
            max_fatal_errors: self.work.max_fatal_errors,
            backfill: self.work.update_stale_data.clone(),
        })
    }

    /// Deadline of every run ordered while `worktime` is the current period.
    ///
    /// An explicit `time_limit_seconds_from_worktime` wins; otherwise
    /// raw-seconds cadences expire one interval after the current period and
    /// calendar cadences never expire. Backfilled windows share the deadline
    /// of the tick that ordered them.
    #[must_use]
    pub fn expires_at(&self, worktime: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = match (self.work.time_limit_seconds_from_worktime, self.work.schedule.interval) {
            (Some(secs), _) => i64::try_from(secs).ok()?,
            (None, interval) if interval.is_raw_seconds() => interval.as_seconds(),
            (None, _) => return None,
        };
        worktime.checked_add_signed(chrono::Duration::seconds(limit))
    }

    /// Soft limit applied to every step of a run.
    #[must_use]
    pub fn soft_time_limit(&self) -> Option<Duration> {
        self.work.soft_time_limit_seconds.map(Duration::from_secs)
    }

    /// Name of the auto-registered concurrency pool of a stage.
    #[must_use]
    pub fn concurrency_pool(&self, stage: &str) -> String {
        format!("__{}_{stage}_concurrency__", self.name)
    }

    /// Name of the auto-registered flow-wide concurrency pool.
    #[must_use]
    pub fn flow_concurrency_pool(&self) -> String {
        format!("__{}_concurrency__", self.name)
    }
}
