//! In-memory ledger used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{retry_cutoff, EntryUpdate, FlowEntry, FlowStatus, LedgerStore, LostEntries, PeriodRange, EXPIRED_INFO};
use crate::core::LedgerError;

type Key = (String, DateTime<Utc>);

/// Ledger backed by a `BTreeMap` behind a mutex.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<BTreeMap<Key, FlowEntry>>,
}

impl InMemoryLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(statuses: &[FlowStatus], status: FlowStatus) -> bool {
        statuses.is_empty() || statuses.contains(&status)
    }

    fn update_where<F, U>(&self, flow: &str, mut filter: F, mut update: U) -> usize
    where
        F: FnMut(&FlowEntry) -> bool,
        U: FnMut(&mut FlowEntry),
    {
        let mut rows = self.rows.lock();
        let mut changed = 0;
        for entry in rows.values_mut().filter(|e| e.flow_name == flow) {
            if filter(entry) {
                update(entry);
                changed += 1;
            }
        }
        changed
    }
}

impl LedgerStore for InMemoryLedger {
    fn create(&self, entry: &FlowEntry) -> Result<bool, LedgerError> {
        let mut rows = self.rows.lock();
        let key = (entry.flow_name.clone(), entry.period);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, entry.clone());
        Ok(true)
    }

    fn get(&self, flow: &str, period: DateTime<Utc>) -> Result<Option<FlowEntry>, LedgerError> {
        Ok(self.rows.lock().get(&(flow.to_string(), period)).cloned())
    }

    fn first_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError> {
        Ok(self.rows.lock().values().find(|e| e.flow_name == flow).cloned())
    }

    fn last_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|e| e.flow_name == flow)
            .next_back()
            .cloned())
    }

    fn recently_updated(&self, flow: &str, limit: usize) -> Result<Vec<FlowEntry>, LedgerError> {
        let mut entries: Vec<FlowEntry> = self
            .rows
            .lock()
            .values()
            .filter(|e| e.flow_name == flow)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.period.cmp(&a.period)));
        entries.truncate(limit);
        Ok(entries)
    }

    fn list(
        &self,
        flow: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<FlowEntry>, LedgerError> {
        Ok(self
            .rows
            .lock()
            .values()
            .rev()
            .filter(|e| e.flow_name == flow && Self::matches(statuses, e.status))
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn count(&self, flow: &str, statuses: &[FlowStatus]) -> Result<usize, LedgerError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|e| e.flow_name == flow && Self::matches(statuses, e.status))
            .count())
    }

    fn flows(&self) -> Result<Vec<String>, LedgerError> {
        let rows = self.rows.lock();
        let names: BTreeSet<&String> = rows.keys().map(|(flow, _)| flow).collect();
        Ok(names.into_iter().cloned().collect())
    }

    fn delete(&self, flow: &str, range: &PeriodRange) -> Result<usize, LedgerError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|(name, period), _| !(name == flow && range.contains(*period)));
        Ok(before - rows.len())
    }

    fn delete_periods(&self, flow: &str, periods: &[DateTime<Utc>]) -> Result<usize, LedgerError> {
        let mut rows = self.rows.lock();
        Ok(periods
            .iter()
            .filter(|period| rows.remove(&(flow.to_string(), **period)).is_some())
            .count())
    }

    fn set_status(
        &self,
        flow: &str,
        status: FlowStatus,
        filter: &[FlowStatus],
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        Ok(self.update_where(
            flow,
            |e| range.contains(e.period) && Self::matches(filter, e.status),
            |e| {
                e.status = status;
                e.updated_at = now;
            },
        ))
    }

    fn set_expiry(
        &self,
        flow: &str,
        expires_at: Option<DateTime<Utc>>,
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        Ok(self.update_where(
            flow,
            |e| range.contains(e.period),
            |e| {
                e.expires_at = expires_at;
                e.updated_at = now;
            },
        ))
    }

    fn apply_update(
        &self,
        flow: &str,
        periods: &[DateTime<Utc>],
        update: &EntryUpdate,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let mut rows = self.rows.lock();
        let mut changed = 0;
        for period in periods {
            if let Some(entry) = rows.get_mut(&(flow.to_string(), *period)) {
                update.apply_to(entry, now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn retry_errors(
        &self,
        flow: &str,
        max_retries: u32,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError> {
        let cutoff = retry_cutoff(now, retry_delay);
        let mut retried = Vec::new();
        self.update_where(
            flow,
            |e| {
                e.status == FlowStatus::Error
                    && e.retries < max_retries
                    && e.finished_at
                        .map_or(true, |finished| cutoff.is_some_and(|cutoff| finished <= cutoff))
                    && !e.is_expired(now)
            },
            |e| {
                e.status = FlowStatus::Add;
                e.retries += 1;
                e.updated_at = now;
                retried.push(e.period);
            },
        );
        Ok(retried)
    }

    fn reset_fatal(&self, flow: &str, config_hash: &str, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        Ok(self.update_where(
            flow,
            |e| e.status == FlowStatus::FatalError && e.config_hash != config_hash,
            |e| {
                e.status = FlowStatus::Add;
                e.retries = 0;
                e.expires_at = None;
                e.config_hash = config_hash.to_string();
                e.updated_at = now;
            },
        ))
    }

    fn clear_lost_entries(&self, now: DateTime<Utc>) -> Result<LostEntries, LedgerError> {
        let mut rows = self.rows.lock();
        let mut lost = LostEntries::default();
        for entry in rows.values_mut() {
            if entry.status == FlowStatus::Run {
                entry.status = FlowStatus::Add;
                entry.updated_at = now;
                lost.reverted += 1;
            }
            if entry.status == FlowStatus::Add && entry.is_expired(now) {
                entry.status = FlowStatus::Error;
                entry.info = Some(EXPIRED_INFO.to_string());
                entry.updated_at = now;
                lost.expired += 1;
            }
        }
        Ok(lost)
    }
}
