//! View models and ledger commands behind the CLI.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PoolsConfig;
use crate::core::{LedgerError, ResourcePool};
use crate::flow::NotebookSource;
use crate::infra::ledger::{EtlStep, FlowEntry, FlowStatus, LedgerStore, PeriodRange};

/// Statuses that count as failures.
pub const ERROR_STATUSES: [FlowStatus; 2] = [FlowStatus::Error, FlowStatus::FatalError];

/// One ledger row as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    /// Period start.
    pub period: DateTime<Utc>,
    /// Status.
    pub status: FlowStatus,
    /// Stage in progress, if any.
    pub etl_step: Option<EtlStep>,
    /// Automatic retries so far.
    pub retries: u32,
    /// Run duration in seconds.
    pub duration: Option<i64>,
    /// Last error or note.
    pub info: Option<String>,
    /// Run log file.
    pub log_path: Option<String>,
    /// Deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<FlowEntry> for EntryView {
    fn from(entry: FlowEntry) -> Self {
        Self {
            period: entry.period,
            status: entry.status,
            etl_step: entry.etl_step,
            retries: entry.retries,
            duration: entry.duration,
            info: entry.info,
            log_path: entry.log_path,
            expires_at: entry.expires_at,
            updated_at: entry.updated_at,
        }
    }
}

/// Per-status counts of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Flow name.
    pub flow: String,
    /// Rows per status.
    pub counts: BTreeMap<FlowStatus, usize>,
    /// Rows in an error status.
    pub errors: usize,
}

/// Pool limit and current usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool name.
    pub name: String,
    /// Slots held right now.
    pub current: u32,
    /// Limit.
    pub limit: u32,
}

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    /// Flow name.
    pub flow: String,
    /// Rows affected.
    pub count: usize,
}

/// Outcome of loading one notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookReport {
    /// Flow name, when the file parsed.
    pub name: Option<String>,
    /// Validation error.
    pub error: Option<String>,
}

/// Most recent rows of a flow, newest first.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn list_entries(ledger: &dyn LedgerStore, flow: &str, limit: usize) -> Result<Vec<EntryView>, LedgerError> {
    Ok(ledger
        .list(flow, &[], Some(limit), 0)?
        .into_iter()
        .map(EntryView::from)
        .collect())
}

/// Rows of a flow in an error status, newest first.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn list_errors(ledger: &dyn LedgerStore, flow: &str, limit: usize) -> Result<Vec<EntryView>, LedgerError> {
    Ok(ledger
        .list(flow, &ERROR_STATUSES, Some(limit), 0)?
        .into_iter()
        .map(EntryView::from)
        .collect())
}

/// Status counts of a flow.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn flow_summary(ledger: &dyn LedgerStore, flow: &str) -> Result<FlowSummary, LedgerError> {
    let mut counts = BTreeMap::new();
    for status in FlowStatus::ALL {
        counts.insert(status, ledger.count(flow, &[status])?);
    }
    Ok(FlowSummary {
        flow: flow.to_string(),
        errors: ledger.count(flow, &ERROR_STATUSES)?,
        counts,
    })
}

/// Summaries of every flow in the ledger.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn summarize_flows(ledger: &dyn LedgerStore) -> Result<Vec<FlowSummary>, LedgerError> {
    ledger
        .flows()?
        .iter()
        .map(|flow| flow_summary(ledger, flow))
        .collect()
}

/// Move rows in `range` back to `ADD` so they run again.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn restart(
    ledger: &dyn LedgerStore,
    flow: &str,
    range: &PeriodRange,
    now: DateTime<Utc>,
) -> Result<CommandReport, LedgerError> {
    let count = ledger.set_status(flow, FlowStatus::Add, &[], range, now)?;
    Ok(CommandReport {
        flow: flow.to_string(),
        count,
    })
}

/// Move every failed row back to `ADD`.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn restart_errors(ledger: &dyn LedgerStore, flow: &str, now: DateTime<Utc>) -> Result<CommandReport, LedgerError> {
    let count = ledger.set_status(flow, FlowStatus::Add, &ERROR_STATUSES, &PeriodRange::all(), now)?;
    Ok(CommandReport {
        flow: flow.to_string(),
        count,
    })
}

/// Delete every row of a flow.
///
/// # Errors
///
/// Propagates ledger failures.
pub fn clear(ledger: &dyn LedgerStore, flow: &str) -> Result<CommandReport, LedgerError> {
    let count = ledger.delete(flow, &PeriodRange::all())?;
    Ok(CommandReport {
        flow: flow.to_string(),
        count,
    })
}

/// Configured pools with zero usage.
#[must_use]
pub fn list_pools(cfg: &PoolsConfig) -> Vec<PoolSnapshot> {
    cfg.limits
        .iter()
        .map(|(name, limit)| PoolSnapshot {
            name: name.clone(),
            current: 0,
            limit: *limit,
        })
        .collect()
}

/// Live usage of a pool table.
#[must_use]
pub fn pool_usage(pool: &ResourcePool) -> Vec<PoolSnapshot> {
    pool.snapshot()
        .into_iter()
        .map(|usage| PoolSnapshot {
            name: usage.name,
            current: usage.current,
            limit: usage.limit,
        })
        .collect()
}

/// Load every notebook and report which ones are valid.
pub fn validate_notebooks(source: &mut dyn NotebookSource) -> Vec<NotebookReport> {
    source
        .notebooks()
        .into_iter()
        .map(|result| match result {
            Ok(notebook) => NotebookReport {
                name: Some(notebook.name),
                error: None,
            },
            Err(error) => NotebookReport {
                name: None,
                error: Some(error),
            },
        })
        .collect()
}
