//! Ordering function: turns due ledger periods into executor tasks.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::builtin::FAKEDATA_PROVIDER;
use super::notebook::{Notebook, NOTEBOOK_SUFFIX};
use super::run::{FlowEnv, FlowRun, StagePools};
use crate::core::{IterationTask, SchedulerError, TaskOrderer};
use crate::infra::ledger::{FlowStatus, PeriodRange};

/// Supplies the current set of flow definitions on every order tick.
pub trait NotebookSource: Send {
    /// Every notebook, or a per-notebook error message.
    fn notebooks(&mut self) -> Vec<Result<Notebook, String>>;
}

impl<S: NotebookSource + ?Sized> NotebookSource for Box<S> {
    fn notebooks(&mut self) -> Vec<Result<Notebook, String>> {
        (**self).notebooks()
    }
}

/// Reads `*.flow.json` files from a directory.
#[derive(Debug, Clone)]
pub struct DirNotebookSource {
    dir: PathBuf,
}

impl DirNotebookSource {
    /// Source over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl NotebookSource for DirNotebookSource {
    fn notebooks(&mut self) -> Vec<Result<Notebook, String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => return vec![Err(format!("read {}: {err}", self.dir.display()))],
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(NOTEBOOK_SUFFIX))
            })
            .collect();
        paths.sort();
        paths.iter().map(|path| Notebook::load(path)).collect()
    }
}

/// Fixed, replaceable list of notebooks.
#[derive(Debug, Clone, Default)]
pub struct StaticNotebooks {
    notebooks: Arc<Mutex<Vec<Notebook>>>,
}

impl StaticNotebooks {
    /// Source over the given notebooks.
    #[must_use]
    pub fn new(notebooks: Vec<Notebook>) -> Self {
        Self {
            notebooks: Arc::new(Mutex::new(notebooks)),
        }
    }

    /// Swap in a new list; clones of this source see the change.
    pub fn replace(&self, notebooks: Vec<Notebook>) {
        *self.notebooks.lock() = notebooks;
    }
}

impl NotebookSource for StaticNotebooks {
    fn notebooks(&mut self) -> Vec<Result<Notebook, String>> {
        self.notebooks.lock().iter().cloned().map(Ok).collect()
    }
}

/// Orders one task per due window of every flow.
pub struct FlowOrderer {
    source: Box<dyn NotebookSource>,
    env: FlowEnv,
    dry_run: bool,
}

impl std::fmt::Debug for FlowOrderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOrderer")
            .field("env", &self.env)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl FlowOrderer {
    /// Orderer over `source`.
    pub fn new(source: impl NotebookSource + 'static, env: FlowEnv) -> Self {
        Self {
            source: Box::new(source),
            env,
            dry_run: false,
        }
    }

    /// Only order `fakedata` flows.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Collaborators shared with the runs.
    #[must_use]
    pub const fn env(&self) -> &FlowEnv {
        &self.env
    }

    /// Compute due work for every flow and build the tasks. Failures are
    /// logged per flow and never stop the others.
    pub fn order_tasks(&mut self) -> Vec<IterationTask> {
        let now = self.env.clock.now();
        let mut tasks = Vec::new();

        for notebook in self.source.notebooks() {
            let notebook = match notebook {
                Ok(notebook) => notebook,
                Err(err) => {
                    error!(error = %err, "invalid notebook skipped");
                    continue;
                }
            };
            if self.dry_run && notebook.provider != FAKEDATA_PROVIDER {
                continue;
            }
            match self.order_flow(&notebook, now) {
                Ok(flow_tasks) => tasks.extend(flow_tasks),
                Err(err) => error!(flow = %notebook.name, error = %err, "flow not ordered"),
            }
        }

        info!(count = tasks.len(), "tasks ordered");
        info!(pools = %self.env.pool.info_text(), "pool usage");
        tasks
    }

    fn order_flow(&self, notebook: &Notebook, now: DateTime<Utc>) -> Result<Vec<IterationTask>, SchedulerError> {
        let pools = StagePools::for_notebook(notebook, &self.env.pool);
        if let Some(missing) = pools.all().into_iter().find(|name| self.env.pool.usage(name).is_none()) {
            return Err(SchedulerError::UnknownPool(missing));
        }

        let work = notebook.due_work()?;
        let now_period = work.schedule.current_period(now)?;
        let due = work.get_due_entries_at(self.env.ledger.as_ref(), now_period, now)?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let expires_at = notebook.expires_at(now_period);
        if let Some(expires_at) = expires_at.filter(|at| *at < now) {
            warn!(flow = %notebook.name, %expires_at, due = due.len(), "deadline already passed, nothing ordered");
            return Ok(Vec::new());
        }

        let windows = work
            .schedule
            .group_periods(due.iter().map(|entry| entry.period).collect())?;

        let mut tasks = Vec::with_capacity(windows.len());
        for window in windows.into_iter().rev() {
            let range = PeriodRange::between(window.start, window.end);
            self.env
                .ledger
                .set_status(&notebook.name, FlowStatus::Run, &[FlowStatus::Add], &range, now)?;
            if expires_at.is_some() {
                self.env.ledger.set_expiry(&notebook.name, expires_at, &range, now)?;
            }
            info!(flow = %notebook.name, start = %window.start, end = %window.end, "flow run ordered");
            let run = FlowRun::new(notebook, window, pools.clone(), self.env.clone());
            tasks.push(run.into_task(notebook, expires_at));
        }
        debug!(flow = %notebook.name, count = tasks.len(), "flow windows ordered");
        Ok(tasks)
    }
}

impl TaskOrderer for FlowOrderer {
    fn order(&mut self) -> Vec<IterationTask> {
        self.order_tasks()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::core::ResourcePool;
    use crate::flow::StageRegistry;
    use crate::infra::ledger::{InMemoryLedger, LedgerStore};
    use crate::util::ManualClock;

    fn notebook(name: &str, provider: &str, pools: &[&str]) -> Notebook {
        serde_json::from_value(json!({
            "name": name,
            "provider": provider,
            "storage": "memory",
            "work": {
                "schedule": {"interval": 60, "timezone": "UTC", "start_time": "00:00:00"},
                "pools": pools,
            }
        }))
        .unwrap()
    }

    fn env(ledger: Arc<InMemoryLedger>) -> FlowEnv {
        FlowEnv {
            ledger,
            registry: Arc::new(StageRegistry::with_builtins()),
            pool: Arc::new(ResourcePool::from_limits([("flows", 10)])),
            clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 30).unwrap())),
            storage_dir: std::env::temp_dir(),
            logs_dir: None,
        }
    }

    #[test]
    fn test_order_marks_due_periods_running() {
        let ledger = Arc::new(InMemoryLedger::new());
        let source = StaticNotebooks::new(vec![notebook("demo", "fakedata", &["flows"])]);
        let mut orderer = FlowOrderer::new(source, env(ledger.clone()));

        let tasks = orderer.order_tasks();
        assert_eq!(tasks.len(), 1);
        let period = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let entry = ledger.get("demo", period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Run);
        assert_eq!(entry.expires_at, Some(period + chrono::Duration::seconds(60)));

        assert!(orderer.order_tasks().is_empty());
    }

    #[test]
    fn test_broken_flow_does_not_block_others() {
        let ledger = Arc::new(InMemoryLedger::new());
        let source = StaticNotebooks::new(vec![
            notebook("broken", "fakedata", &["no_such_pool"]),
            notebook("good", "fakedata", &[]),
        ]);
        let mut orderer = FlowOrderer::new(source, env(ledger.clone()));

        assert_eq!(orderer.order_tasks().len(), 1);
        assert_eq!(ledger.flows().unwrap(), vec!["good".to_string()]);
    }

    #[test]
    fn test_dry_run_orders_only_fakedata() {
        let ledger = Arc::new(InMemoryLedger::new());
        let source = StaticNotebooks::new(vec![notebook("real", "postgres", &[]), notebook("fake", "fakedata", &[])]);
        let mut orderer = FlowOrderer::new(source, env(ledger)).with_dry_run(true);
        let tasks = orderer.order_tasks();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].name().starts_with("fake "));
    }

    #[test]
    fn test_dir_source_reports_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&notebook("", "fakedata", &[])).unwrap();
        std::fs::write(dir.path().join("a.flow.json"), good).unwrap();
        std::fs::write(dir.path().join("b.flow.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        let results = DirNotebookSource::new(dir.path()).notebooks();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().name, "a");
        assert!(results[1].is_err());
    }
}
