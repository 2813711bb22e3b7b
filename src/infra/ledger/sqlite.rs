//! SQLite-backed ledger.
//!
//! A single connection sits behind a mutex, which serializes every write.
//! Timestamps are stored as fixed-width RFC 3339 UTC text so ordering and
//! range filters work lexically.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use super::{
    retry_cutoff, EntryUpdate, EtlStep, FlowEntry, FlowStatus, LedgerStore, LostEntries, PeriodRange, EXPIRED_INFO,
};
use crate::core::LedgerError;

const COLUMNS: &str = "flow_name, period_start, status, etl_step, retries, duration, info, log_path, \
                       expires_at, started_at, finished_at, created_at, updated_at, config_hash, payload";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flow_entries (
        flow_name TEXT NOT NULL,
        period_start TEXT NOT NULL,
        status TEXT NOT NULL,
        etl_step TEXT,
        retries INTEGER NOT NULL DEFAULT 0,
        duration INTEGER,
        info TEXT,
        log_path TEXT,
        expires_at TEXT,
        started_at TEXT,
        finished_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        config_hash TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (flow_name, period_start)
    );
    CREATE INDEX IF NOT EXISTS idx_flow_entries_status
    ON flow_entries (flow_name, status);
    CREATE INDEX IF NOT EXISTS idx_flow_entries_updated
    ON flow_entries (flow_name, updated_at);
";

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_opt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("timestamp '{value}': {e}")))
}

fn parse_ts_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    value.as_deref().map(parse_ts).transpose()
}

/// Row as stored, before decoding.
struct RawEntry {
    flow_name: String,
    period: String,
    status: String,
    etl_step: Option<String>,
    retries: i64,
    duration: Option<i64>,
    info: Option<String>,
    log_path: Option<String>,
    expires_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    created_at: String,
    updated_at: String,
    config_hash: String,
    payload: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            flow_name: row.get(0)?,
            period: row.get(1)?,
            status: row.get(2)?,
            etl_step: row.get(3)?,
            retries: row.get(4)?,
            duration: row.get(5)?,
            info: row.get(6)?,
            log_path: row.get(7)?,
            expires_at: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            config_hash: row.get(13)?,
            payload: row.get(14)?,
        })
    }

    fn decode(self) -> Result<FlowEntry, LedgerError> {
        Ok(FlowEntry {
            period: parse_ts(&self.period)?,
            status: self.status.parse()?,
            etl_step: self.etl_step.as_deref().map(str::parse::<EtlStep>).transpose()?,
            retries: u32::try_from(self.retries)
                .map_err(|_| LedgerError::Corrupt(format!("negative retries {}", self.retries)))?,
            duration: self.duration,
            info: self.info,
            log_path: self.log_path,
            expires_at: parse_ts_opt(self.expires_at)?,
            started_at: parse_ts_opt(self.started_at)?,
            finished_at: parse_ts_opt(self.finished_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| LedgerError::Corrupt(format!("payload: {e}")))?,
            config_hash: self.config_hash,
            flow_name: self.flow_name,
        })
    }
}

/// `WHERE` clause builder with positional text parameters.
struct Filter {
    clauses: Vec<String>,
    params: Vec<String>,
}

impl Filter {
    fn flow(flow: &str) -> Self {
        Self {
            clauses: vec!["flow_name = ?".to_string()],
            params: vec![flow.to_string()],
        }
    }

    fn statuses(mut self, statuses: &[FlowStatus]) -> Self {
        if !statuses.is_empty() {
            let marks = vec!["?"; statuses.len()].join(", ");
            self.clauses.push(format!("status IN ({marks})"));
            self.params.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        self
    }

    fn range(mut self, range: &PeriodRange) -> Self {
        if let Some(from) = range.from {
            self.clauses.push("period_start >= ?".to_string());
            self.params.push(ts(from));
        }
        if let Some(to) = range.to {
            self.clauses.push("period_start <= ?".to_string());
            self.params.push(ts(to));
        }
        self
    }

    fn sql(&self) -> String {
        self.clauses.join(" AND ")
    }
}

/// Ledger stored in a SQLite database.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open (and create if needed) a database file.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the file or schema cannot be set up.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        debug!(path = %path.display(), "opened ledger database");
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn select(conn: &Connection, sql: &str, params: &[String]) -> Result<Vec<FlowEntry>, LedgerError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), RawEntry::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    fn select_one(conn: &Connection, sql: &str, params: &[String]) -> Result<Option<FlowEntry>, LedgerError> {
        conn.query_row(sql, params_from_iter(params.iter()), RawEntry::from_row)
            .optional()?
            .map(RawEntry::decode)
            .transpose()
    }

    fn write_entry(tx: &Transaction<'_>, entry: &FlowEntry) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| LedgerError::Backend(format!("serialize payload: {e}")))?;
        tx.execute(
            "UPDATE flow_entries SET status = ?1, etl_step = ?2, retries = ?3, duration = ?4, info = ?5,
                 log_path = ?6, expires_at = ?7, started_at = ?8, finished_at = ?9, updated_at = ?10,
                 config_hash = ?11, payload = ?12
             WHERE flow_name = ?13 AND period_start = ?14",
            params![
                entry.status.as_str(),
                entry.etl_step.map(EtlStep::as_str),
                entry.retries,
                entry.duration,
                entry.info,
                entry.log_path,
                ts_opt(entry.expires_at),
                ts_opt(entry.started_at),
                ts_opt(entry.finished_at),
                ts(entry.updated_at),
                entry.config_hash,
                payload,
                entry.flow_name,
                ts(entry.period),
            ],
        )?;
        Ok(())
    }

    fn execute(&self, sql: &str, params: &[String]) -> Result<usize, LedgerError> {
        let conn = self.conn.lock();
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }
}

impl LedgerStore for SqliteLedger {
    fn create(&self, entry: &FlowEntry) -> Result<bool, LedgerError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| LedgerError::Backend(format!("serialize payload: {e}")))?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO flow_entries ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                entry.flow_name,
                ts(entry.period),
                entry.status.as_str(),
                entry.etl_step.map(EtlStep::as_str),
                entry.retries,
                entry.duration,
                entry.info,
                entry.log_path,
                ts_opt(entry.expires_at),
                ts_opt(entry.started_at),
                ts_opt(entry.finished_at),
                ts(entry.created_at),
                ts(entry.updated_at),
                entry.config_hash,
                payload,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get(&self, flow: &str, period: DateTime<Utc>) -> Result<Option<FlowEntry>, LedgerError> {
        let conn = self.conn.lock();
        Self::select_one(
            &conn,
            &format!("SELECT {COLUMNS} FROM flow_entries WHERE flow_name = ? AND period_start = ?"),
            &[flow.to_string(), ts(period)],
        )
    }

    fn first_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError> {
        let conn = self.conn.lock();
        Self::select_one(
            &conn,
            &format!("SELECT {COLUMNS} FROM flow_entries WHERE flow_name = ? ORDER BY period_start ASC LIMIT 1"),
            &[flow.to_string()],
        )
    }

    fn last_entry(&self, flow: &str) -> Result<Option<FlowEntry>, LedgerError> {
        let conn = self.conn.lock();
        Self::select_one(
            &conn,
            &format!("SELECT {COLUMNS} FROM flow_entries WHERE flow_name = ? ORDER BY period_start DESC LIMIT 1"),
            &[flow.to_string()],
        )
    }

    fn recently_updated(&self, flow: &str, limit: usize) -> Result<Vec<FlowEntry>, LedgerError> {
        let conn = self.conn.lock();
        Self::select(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM flow_entries WHERE flow_name = ?
                 ORDER BY updated_at DESC, period_start DESC LIMIT {limit}"
            ),
            &[flow.to_string()],
        )
    }

    fn list(
        &self,
        flow: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<FlowEntry>, LedgerError> {
        let filter = Filter::flow(flow).statuses(statuses);
        let limit = limit.map_or_else(|| "-1".to_string(), |n| n.to_string());
        let conn = self.conn.lock();
        Self::select(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM flow_entries WHERE {}
                 ORDER BY period_start DESC LIMIT {limit} OFFSET {offset}",
                filter.sql()
            ),
            &filter.params,
        )
    }

    fn count(&self, flow: &str, statuses: &[FlowStatus]) -> Result<usize, LedgerError> {
        let filter = Filter::flow(flow).statuses(statuses);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM flow_entries WHERE {}", filter.sql()),
            params_from_iter(filter.params.iter()),
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|e| LedgerError::Corrupt(e.to_string()))
    }

    fn flows(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT flow_name FROM flow_entries ORDER BY flow_name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn delete(&self, flow: &str, range: &PeriodRange) -> Result<usize, LedgerError> {
        let filter = Filter::flow(flow).range(range);
        self.execute(&format!("DELETE FROM flow_entries WHERE {}", filter.sql()), &filter.params)
    }

    fn delete_periods(&self, flow: &str, periods: &[DateTime<Utc>]) -> Result<usize, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for period in periods {
            deleted += tx.execute(
                "DELETE FROM flow_entries WHERE flow_name = ?1 AND period_start = ?2",
                params![flow, ts(*period)],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn set_status(
        &self,
        flow: &str,
        status: FlowStatus,
        filter: &[FlowStatus],
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let filter = Filter::flow(flow).statuses(filter).range(range);
        let mut params = vec![status.as_str().to_string(), ts(now)];
        params.extend(filter.params.iter().cloned());
        self.execute(
            &format!("UPDATE flow_entries SET status = ?, updated_at = ? WHERE {}", filter.sql()),
            &params,
        )
    }

    fn set_expiry(
        &self,
        flow: &str,
        expires_at: Option<DateTime<Utc>>,
        range: &PeriodRange,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let filter = Filter::flow(flow).range(range);
        let mut params: Vec<Option<String>> = vec![ts_opt(expires_at), Some(ts(now))];
        params.extend(filter.params.iter().cloned().map(Some));
        let conn = self.conn.lock();
        Ok(conn.execute(
            &format!("UPDATE flow_entries SET expires_at = ?, updated_at = ? WHERE {}", filter.sql()),
            params_from_iter(params.iter()),
        )?)
    }

    fn apply_update(
        &self,
        flow: &str,
        periods: &[DateTime<Utc>],
        update: &EntryUpdate,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for period in periods {
            let current = Self::select_one(
                &tx,
                &format!("SELECT {COLUMNS} FROM flow_entries WHERE flow_name = ? AND period_start = ?"),
                &[flow.to_string(), ts(*period)],
            )?;
            if let Some(mut entry) = current {
                update.apply_to(&mut entry, now);
                Self::write_entry(&tx, &entry)?;
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn retry_errors(
        &self,
        flow: &str,
        max_retries: u32,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError> {
        // NULL matches no finished row.
        let cutoff = retry_cutoff(now, retry_delay).map(ts);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "UPDATE flow_entries
             SET status = 'ADD', retries = retries + 1, updated_at = ?1
             WHERE flow_name = ?2
               AND status = 'ERROR'
               AND retries < ?3
               AND (finished_at IS NULL OR finished_at <= ?4)
               AND (expires_at IS NULL OR expires_at >= ?1)
             RETURNING period_start",
        )?;
        let periods = stmt
            .query_map(params![ts(now), flow, max_retries, cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        periods.iter().map(|p| parse_ts(p)).collect()
    }

    fn reset_fatal(&self, flow: &str, config_hash: &str, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE flow_entries
             SET status = 'ADD', retries = 0, expires_at = NULL, config_hash = ?1, updated_at = ?2
             WHERE flow_name = ?3 AND status = 'FATAL_ERROR' AND config_hash != ?1",
            params![config_hash, ts(now), flow],
        )?)
    }

    fn clear_lost_entries(&self, now: DateTime<Utc>) -> Result<LostEntries, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let reverted = tx.execute(
            "UPDATE flow_entries SET status = 'ADD', updated_at = ?1 WHERE status = 'RUN'",
            params![ts(now)],
        )?;
        let expired = tx.execute(
            "UPDATE flow_entries SET status = 'ERROR', info = ?1, updated_at = ?2
             WHERE status = 'ADD' AND expires_at IS NOT NULL AND expires_at < ?2",
            params![EXPIRED_INFO, ts(now)],
        )?;
        tx.commit()?;
        Ok(LostEntries { reverted, expired })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + chrono::Duration::microseconds(5);
        assert!(ts(a) < ts(b));
        assert_eq!(ts(a).len(), ts(b).len());
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }

    #[test]
    fn test_corrupt_status_is_reported() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ledger.create(&FlowEntry::new("f", t, FlowStatus::Add, "h", t)).unwrap();
        ledger
            .execute("UPDATE flow_entries SET status = 'BOGUS'", &[])
            .unwrap();
        assert!(matches!(ledger.get("f", t), Err(LedgerError::Corrupt(_))));
    }
}
