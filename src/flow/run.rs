//! Export → Transform → Load run for one window of periods.
//!
//! [`FlowRun`] is a [`StepSource`]: every call to `next_step` advances a small
//! state machine by exactly one observable step. Progress values are written
//! to the ledger for every period of the window before being handed to the
//! driver; pool waits and export sleeps are returned as suspension
//! directives.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::notebook::Notebook;
use super::registry::{StageRegistry, Stages};
use super::stage::{ExportBatch, ExportItem, StageContext, StageParams, TransformedBatch};
use crate::core::{
    IterationTask, PeriodWindow, ResourcePool, SchedulerError, StageError, StepResult, StepSource,
    SuspensionDirective,
};
use crate::infra::ledger::{EntryUpdate, EtlStep, FlowEntry, FlowStatus, LedgerStore, EXPIRED_INFO};
use crate::util::Clock;

/// Message recorded for panics inside stage code.
const UNKNOWN_STAGE_ERROR: &str = "unknown error";
/// Info recorded when a step overran the soft time limit.
pub const SOFT_TIME_LIMIT_INFO: &str = "soft time limit exceeded";

/// Shared collaborators of every run.
#[derive(Clone)]
pub struct FlowEnv {
    /// Ledger receiving progress.
    pub ledger: Arc<dyn LedgerStore>,
    /// Stage factories.
    pub registry: Arc<StageRegistry>,
    /// Admission pools.
    pub pool: Arc<ResourcePool>,
    /// Engine clock.
    pub clock: Arc<dyn Clock>,
    /// Root of file-based storages.
    pub storage_dir: PathBuf,
    /// Directory of per-run log files; `None` disables them.
    pub logs_dir: Option<PathBuf>,
}

impl std::fmt::Debug for FlowEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEnv")
            .field("storage_dir", &self.storage_dir)
            .field("logs_dir", &self.logs_dir)
            .finish_non_exhaustive()
    }
}

/// Pool sets waited on before each stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePools {
    /// Held while exporting.
    pub export: Vec<String>,
    /// Held while transforming.
    pub transform: Vec<String>,
    /// Held while loading.
    pub load: Vec<String>,
}

impl StagePools {
    /// Flow-wide pools plus each stage's own pools and concurrency pool.
    ///
    /// Concurrency pools are (re)declared on `pool` with the configured limit.
    pub fn for_notebook(notebook: &Notebook, pool: &ResourcePool) -> Self {
        let mut common = notebook.work.pools.clone();
        if let Some(limit) = notebook.work.concurrency {
            let name = notebook.flow_concurrency_pool();
            pool.ensure(&name, limit);
            common.push(name);
        }

        let mut sets = notebook.stages().map(|(stage, policy)| {
            let mut names = common.clone();
            names.extend(policy.pools.iter().cloned());
            if let Some(limit) = policy.concurrency {
                let name = notebook.concurrency_pool(stage);
                pool.ensure(&name, limit);
                names.push(name);
            }
            let mut seen = std::collections::BTreeSet::new();
            names.retain(|name| seen.insert(name.clone()));
            names
        });

        Self {
            export: std::mem::take(&mut sets[0]),
            transform: std::mem::take(&mut sets[1]),
            load: std::mem::take(&mut sets[2]),
        }
    }

    /// Every distinct pool name.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .export
            .iter()
            .chain(&self.transform)
            .chain(&self.load)
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Context recorded in the ledger payload.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    /// Export provider.
    pub provider: String,
    /// Load storage.
    pub storage: String,
    /// First period of the window.
    pub start_period: DateTime<Utc>,
    /// Last period of the window.
    pub end_period: DateTime<Utc>,
    /// Bytes transformed so far.
    pub size: usize,
    /// Rows transformed so far.
    pub number_rows: usize,
    /// Rows rejected so far.
    pub number_error_lines: usize,
    /// Arguments reported by the export.
    pub export_kwargs: Map<String, Value>,
}

enum State {
    Start,
    ExportMark,
    ExportWait,
    Export,
    TransformMark(ExportBatch),
    TransformWait(ExportBatch),
    Transform(ExportBatch),
    LoadMark(TransformedBatch),
    LoadWait(TransformedBatch),
    Load(TransformedBatch),
    Succeeded,
    Failed(StageError),
    Finish(Option<StageError>),
    Ended(Option<StageError>),
    Done,
}

/// One ETL run over a window of periods.
pub struct FlowRun {
    flow: String,
    config_hash: String,
    window: PeriodWindow,
    stage_ctx: StageContext,
    stage_params: StageParams,
    pools: StagePools,
    env: FlowEnv,
    context: RunContext,
    stages: Option<Stages>,
    load_open: bool,
    started_at: Option<DateTime<Utc>>,
    log_path: Option<PathBuf>,
    status_written: bool,
    finished: bool,
    state: State,
}

impl std::fmt::Debug for FlowRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRun")
            .field("flow", &self.flow)
            .field("window", &self.window)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl FlowRun {
    /// Prepare a run. Nothing is touched until the first step.
    #[must_use]
    pub fn new(notebook: &Notebook, window: PeriodWindow, pools: StagePools, env: FlowEnv) -> Self {
        let stage_params = StageParams {
            export: Value::Object(notebook.export.params.clone()),
            transform: Value::Object(notebook.transform.params.clone()),
            load: Value::Object(notebook.load.params.clone()),
        };
        let stage_ctx = StageContext {
            flow: notebook.name.clone(),
            provider: notebook.provider.clone(),
            storage: notebook.storage.clone(),
            start_period: window.start,
            end_period: window.end,
            params: Value::Null,
            storage_dir: env.storage_dir.clone(),
        };
        let log_path = env
            .logs_dir
            .as_ref()
            .map(|dir| dir.join(&notebook.name).join(format!("{}.log", period_text(&window))));
        Self {
            flow: notebook.name.clone(),
            config_hash: notebook.config_hash(),
            context: RunContext {
                provider: notebook.provider.clone(),
                storage: notebook.storage.clone(),
                start_period: window.start,
                end_period: window.end,
                size: 0,
                number_rows: 0,
                number_error_lines: 0,
                export_kwargs: Map::new(),
            },
            window,
            stage_ctx,
            stage_params,
            pools,
            env,
            stages: None,
            load_open: false,
            started_at: None,
            log_path,
            status_written: false,
            finished: false,
            state: State::Start,
        }
    }

    /// Wrap the run in a task with the given deadline and the notebook's
    /// soft limit.
    #[must_use]
    pub fn into_task(self, notebook: &Notebook, expires_at: Option<DateTime<Utc>>) -> IterationTask {
        let name = format!("{} {}", self.flow, period_text(&self.window));
        let pool = Arc::clone(&self.env.pool);
        let clock = Arc::clone(&self.env.clock);
        IterationTask::new(name, self, pool, clock)
            .with_expires_at(expires_at)
            .with_soft_time_limit(notebook.soft_time_limit())
    }

    /// Window covered by this run.
    #[must_use]
    pub const fn window(&self) -> &PeriodWindow {
        &self.window
    }

    fn payload(&self) -> Value {
        to_json(&self.flow, &self.context)
    }

    fn duration_until(&self, now: DateTime<Utc>) -> i64 {
        self.started_at.map_or(0, |started| (now - started).num_seconds())
    }

    fn start(&mut self) -> Result<EntryUpdate, SchedulerError> {
        let now = self.env.clock.now();
        for period in &self.window.periods {
            let entry = FlowEntry::new(&self.flow, *period, FlowStatus::Run, &self.config_hash, now);
            self.env.ledger.create(&entry)?;
        }
        self.started_at = Some(now);
        info!(flow = %self.flow, start = %self.window.start, end = %self.window.end, "flow run started");

        Ok(EntryUpdate {
            status: Some(FlowStatus::Run),
            started_at: Some(now),
            config_hash: Some(self.config_hash.clone()),
            log_path: self.log_path.as_ref().map(|p| p.display().to_string()),
            payload: Some(self.payload()),
            ..EntryUpdate::default()
        })
    }

    fn open_stages(&mut self) -> Result<(), StageError> {
        let registry = Arc::clone(&self.env.registry);
        let mut stages = guarded(|| registry.build(&self.stage_ctx, &self.stage_params))?;
        guarded(|| stages.load.open())?;
        self.load_open = true;
        self.stages = Some(stages);
        Ok(())
    }

    fn close_load(&mut self) -> Result<(), StageError> {
        if !std::mem::replace(&mut self.load_open, false) {
            return Ok(());
        }
        match self.stages.as_mut() {
            Some(stages) => guarded(|| stages.load.close()),
            None => Ok(()),
        }
    }

    fn stages(&mut self) -> Result<&mut Stages, StageError> {
        self.stages
            .as_mut()
            .ok_or_else(|| StageError::Failed("stages used before they were opened".into()))
    }

    fn pool_wait(names: &[String]) -> Option<StepResult> {
        (!names.is_empty()).then(|| StepResult::Suspend(SuspensionDirective::pools(names.iter().cloned())))
    }

    /// Write the update to every period of the window and hand it back as JSON.
    fn emit(&mut self, update: &EntryUpdate, extra: Option<(&str, Value)>) -> StepResult {
        let now = self.env.clock.now();
        if let Err(err) = self.env.ledger.apply_update(&self.flow, &self.window.periods, update, now) {
            warn!(flow = %self.flow, error = %err, "ledger update failed, abandoning run");
            if let Err(close_err) = self.close_load() {
                warn!(flow = %self.flow, error = %close_err, "load close failed");
            }
            self.state = State::Done;
            return StepResult::Failed(err.into());
        }

        let mut value = to_json(&self.flow, update);
        if let (Value::Object(map), Some((key, extra))) = (&mut value, extra) {
            map.insert(key.to_string(), extra);
        }
        debug!(flow = %self.flow, update = %value, "flow progress");
        self.append_log(&value);
        StepResult::Value(value)
    }

    fn append_log(&self, value: &Value) {
        let Some(path) = &self.log_path else {
            return;
        };
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path))
            .and_then(|mut file| writeln!(file, "{value}"));
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "cannot write run log");
        }
    }

    fn fail(&mut self, err: StageError) {
        warn!(flow = %self.flow, error = %err, "flow stage failed");
        self.state = State::Failed(err);
    }
}

impl StepSource for FlowRun {
    fn next_step(&mut self) -> StepResult {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Start => {
                    let update = match self.start() {
                        Ok(update) => update,
                        Err(err) => return StepResult::Failed(err),
                    };
                    self.state = match self.open_stages() {
                        Ok(()) => State::ExportMark,
                        Err(err) => State::Failed(err),
                    };
                    return self.emit(&update, None);
                }
                State::ExportMark => {
                    self.state = State::ExportWait;
                    let update = EntryUpdate {
                        etl_step: Some(Some(EtlStep::Export)),
                        ..EntryUpdate::default()
                    };
                    return self.emit(&update, None);
                }
                State::ExportWait => {
                    self.state = State::Export;
                    if let Some(wait) = Self::pool_wait(&self.pools.export) {
                        return wait;
                    }
                }
                State::Export => {
                    let item = self.stages().and_then(|stages| guarded(|| stages.export.next_item()));
                    match item {
                        Ok(Some(ExportItem::Batch(batch))) => {
                            self.context.export_kwargs.extend(batch.export_kwargs.clone());
                            self.state = State::TransformMark(batch);
                        }
                        Ok(Some(ExportItem::Sleep(duration))) => {
                            self.state = State::ExportMark;
                            return StepResult::Suspend(SuspensionDirective::sleep(
                                self.env.clock.as_ref(),
                                duration,
                            ));
                        }
                        Ok(None) => self.state = State::Succeeded,
                        Err(err) => self.fail(err),
                    }
                }
                State::TransformMark(batch) => {
                    self.state = State::TransformWait(batch);
                    let update = EntryUpdate {
                        etl_step: Some(Some(EtlStep::Transform)),
                        payload: Some(self.payload()),
                        ..EntryUpdate::default()
                    };
                    return self.emit(&update, None);
                }
                State::TransformWait(batch) => {
                    self.state = State::Transform(batch);
                    if let Some(wait) = Self::pool_wait(&self.pools.transform) {
                        return wait;
                    }
                }
                State::Transform(batch) => {
                    let result = self
                        .stages()
                        .and_then(|stages| guarded(|| stages.transform.transform(batch)));
                    match result {
                        Ok(out) => {
                            self.context.size += out.size;
                            self.context.number_rows += out.rows.len();
                            self.context.number_error_lines += out.data_errors.len();
                            self.state = State::LoadMark(out);
                        }
                        Err(err) => self.fail(err),
                    }
                }
                State::LoadMark(out) => {
                    let data_errors = Value::from(out.data_errors.clone());
                    self.state = State::LoadWait(out);
                    let update = EntryUpdate {
                        etl_step: Some(Some(EtlStep::Load)),
                        payload: Some(self.payload()),
                        ..EntryUpdate::default()
                    };
                    return self.emit(&update, Some(("data_errors", data_errors)));
                }
                State::LoadWait(out) => {
                    self.state = State::Load(out);
                    if let Some(wait) = Self::pool_wait(&self.pools.load) {
                        return wait;
                    }
                }
                State::Load(out) => {
                    match self.stages().and_then(|stages| guarded(|| stages.load.load(&out))) {
                        Ok(()) => self.state = State::ExportMark,
                        Err(err) => self.fail(err),
                    }
                }
                State::Succeeded => {
                    if let Err(err) = self.close_load() {
                        self.fail(err);
                        continue;
                    }
                    self.context.export_kwargs.clear();
                    self.status_written = true;
                    self.state = State::Finish(None);
                    let update = EntryUpdate {
                        status: Some(FlowStatus::Success),
                        retries: Some(0),
                        etl_step: Some(None),
                        payload: Some(self.payload()),
                        ..EntryUpdate::default()
                    };
                    return self.emit(&update, None);
                }
                State::Failed(err) => {
                    if let Err(close_err) = self.close_load() {
                        warn!(flow = %self.flow, error = %close_err, "load close failed");
                    }
                    let status = if err.is_fatal() {
                        FlowStatus::FatalError
                    } else {
                        FlowStatus::Error
                    };
                    let update = EntryUpdate {
                        status: Some(status),
                        info: Some(Some(err.message().to_string())),
                        ..EntryUpdate::default()
                    };
                    self.status_written = true;
                    self.state = State::Finish(Some(err));
                    return self.emit(&update, None);
                }
                State::Finish(outcome) => {
                    let now = self.env.clock.now();
                    self.finished = true;
                    self.state = State::Ended(outcome);
                    let update = EntryUpdate {
                        finished_at: Some(now),
                        duration: Some(self.duration_until(now)),
                        ..EntryUpdate::default()
                    };
                    return self.emit(&update, None);
                }
                State::Ended(outcome) => {
                    info!(flow = %self.flow, start = %self.window.start, failed = outcome.is_some(), "flow run finished");
                    return match outcome {
                        Some(err) => StepResult::Failed(err.into()),
                        None => StepResult::Done,
                    };
                }
                State::Done => return StepResult::Done,
            }
        }
    }

    /// Close the run in the ledger: `ERROR` unless a final status was already
    /// written, and always `finished_at` and `duration`.
    fn abandon(&mut self, reason: &SchedulerError) {
        if self.finished {
            return;
        }
        if let Err(err) = self.close_load() {
            warn!(flow = %self.flow, error = %err, "load close failed");
        }
        let now = self.env.clock.now();
        let mut update = EntryUpdate {
            finished_at: Some(now),
            duration: Some(self.duration_until(now)),
            ..EntryUpdate::default()
        };
        if !self.status_written {
            update.status = Some(FlowStatus::Error);
            update.info = Some(Some(abandon_info(reason)));
        }
        self.finished = true;
        self.state = State::Done;
        warn!(flow = %self.flow, start = %self.window.start, reason = %reason, "flow run abandoned");
        if let StepResult::Failed(err) = self.emit(&update, None) {
            warn!(flow = %self.flow, error = %err, "abandoned run not recorded");
        }
    }
}

fn abandon_info(reason: &SchedulerError) -> String {
    match reason {
        SchedulerError::Expired { .. } => EXPIRED_INFO.to_string(),
        SchedulerError::SoftTimeLimitExceeded { .. } => SOFT_TIME_LIMIT_INFO.to_string(),
        other => other.to_string(),
    }
}

fn to_json(flow: &str, value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        warn!(flow = %flow, error = %err, "payload not serializable, recorded as null");
        Value::Null
    })
}

/// Run stage code, turning a panic into a retryable stage error.
fn guarded<T>(f: impl FnOnce() -> Result<T, StageError>) -> Result<T, StageError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| Err(StageError::Failed(UNKNOWN_STAGE_ERROR.into())))
}

/// `2024-01-01T10-00-00`, or `start end` for multi-period windows.
fn period_text(window: &PeriodWindow) -> String {
    let fmt = |t: DateTime<Utc>| t.format("%Y-%m-%dT%H-%M-%S").to_string();
    if window.start == window.end {
        fmt(window.start)
    } else {
        format!("{} {}", fmt(window.start), fmt(window.end))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::infra::ledger::InMemoryLedger;
    use crate::util::ManualClock;

    struct Fixture {
        env: FlowEnv,
        ledger: Arc<InMemoryLedger>,
        period: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let period = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        let env = FlowEnv {
            ledger: ledger.clone(),
            registry: Arc::new(StageRegistry::with_builtins()),
            pool: Arc::new(ResourcePool::new()),
            clock: Arc::new(ManualClock::new(period)),
            storage_dir: std::env::temp_dir(),
            logs_dir: None,
        };
        Fixture { env, ledger, period }
    }

    fn notebook(export: Value) -> Notebook {
        let mut doc = json!({
            "name": "demo",
            "provider": "fakedata",
            "storage": "memory",
            "work": {"schedule": {"interval": 60, "timezone": "UTC", "start_time": "00:00:00"}},
            "export": {"concurrency": 1}
        });
        if let (Some(target), Value::Object(extra)) = (doc["export"].as_object_mut(), export) {
            target.extend(extra);
        }
        serde_json::from_value(doc).unwrap()
    }

    fn run(fx: &Fixture, nb: &Notebook) -> Result<Vec<Value>, SchedulerError> {
        let window = PeriodWindow {
            start: fx.period,
            end: fx.period,
            periods: vec![fx.period],
        };
        let pools = StagePools::for_notebook(nb, &fx.env.pool);
        FlowRun::new(nb, window, pools, fx.env.clone())
            .into_task(nb, nb.expires_at(fx.period))
            .run_to_completion()
    }

    #[test]
    fn test_successful_run_records_success() {
        let fx = fixture();
        let nb = notebook(json!({"rows": 4}));
        let values = run(&fx, &nb).unwrap();

        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Success);
        assert_eq!(entry.etl_step, None);
        assert_eq!(entry.retries, 0);
        assert!(entry.finished_at.is_some());
        assert_eq!(entry.payload["number_rows"], json!(4));

        let store = fx.env.registry.memory_store();
        assert_eq!(store.rows("demo").len(), 4);
        assert_eq!(store.sessions("demo"), (1, 1));
        assert_eq!(values.first().and_then(|v| v.get("status")), Some(&json!("RUN")));
        assert!(values.iter().any(|v| v.get("data_errors").is_some()));
    }

    #[test]
    fn test_stage_error_marks_error_and_closes_load() {
        let fx = fixture();
        let nb = notebook(json!({"rows": 5, "fail": "error", "fail_on_batch": 2}));
        let err = run(&fx, &nb).unwrap_err();
        assert!(matches!(err, SchedulerError::Stage(StageError::Failed(_))));

        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Error);
        assert!(entry.info.unwrap().contains("fakedata"));
        assert!(entry.finished_at.is_some());
        let store = fx.env.registry.memory_store();
        assert_eq!(store.rows("demo").len(), 2);
        assert_eq!(store.sessions("demo"), (1, 1));
    }

    #[test]
    fn test_fatal_error_marks_fatal() {
        let fx = fixture();
        let nb = notebook(json!({"fail": "fatal"}));
        assert!(run(&fx, &nb).is_err());
        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::FatalError);
    }

    #[test]
    fn test_expiry_mid_run_records_error_and_closes_load() {
        let fx = fixture();
        let nb = notebook(json!({"rows": 10, "sleep_between_batches": 10}));
        let window = PeriodWindow {
            start: fx.period,
            end: fx.period,
            periods: vec![fx.period],
        };
        let pools = StagePools::for_notebook(&nb, &fx.env.pool);
        let deadline = fx.period + chrono::Duration::seconds(15);
        let err = FlowRun::new(&nb, window, pools, fx.env.clone())
            .into_task(&nb, Some(deadline))
            .run_to_completion()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Expired { .. }));

        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Error);
        assert_eq!(entry.info.as_deref(), Some(EXPIRED_INFO));
        assert!(entry.finished_at.is_some());
        assert_eq!(entry.duration, Some(20));
        assert_eq!(fx.env.registry.memory_store().sessions("demo"), (1, 1));
        assert_eq!(fx.env.pool.usage("__demo_export_concurrency__").unwrap().current, 0);
    }

    #[test]
    fn test_expired_before_start_closes_ordered_rows() {
        let fx = fixture();
        let nb = notebook(json!({}));
        let ordered = FlowEntry::new("demo", fx.period, FlowStatus::Run, &nb.config_hash(), fx.period);
        fx.ledger.create(&ordered).unwrap();
        let window = PeriodWindow {
            start: fx.period,
            end: fx.period,
            periods: vec![fx.period],
        };
        let pools = StagePools::for_notebook(&nb, &fx.env.pool);
        let mut task = FlowRun::new(&nb, window, pools, fx.env.clone())
            .into_task(&nb, Some(fx.period - chrono::Duration::seconds(1)));
        assert!(matches!(task.step(), Err(SchedulerError::Expired { .. })));

        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Error);
        assert_eq!(entry.duration, Some(0));
        assert_eq!(fx.env.registry.memory_store().sessions("demo"), (0, 0));
    }

    #[test]
    fn test_soft_limit_after_success_keeps_success() {
        let fx = fixture();
        let nb = notebook(json!({"rows": 2}));
        let window = PeriodWindow {
            start: fx.period,
            end: fx.period,
            periods: vec![fx.period],
        };
        let mut run = FlowRun::new(&nb, window, StagePools::default(), fx.env.clone());
        while !run.status_written {
            assert!(!matches!(run.next_step(), StepResult::Failed(_) | StepResult::Done));
        }
        run.abandon(&SchedulerError::SoftTimeLimitExceeded {
            limit: std::time::Duration::from_secs(1),
            elapsed: std::time::Duration::from_secs(2),
        });

        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Success);
        assert!(entry.finished_at.is_some());
        assert!(matches!(run.next_step(), StepResult::Done));
    }

    #[test]
    fn test_concurrency_pool_is_registered_and_released() {
        let fx = fixture();
        let nb = notebook(json!({"rows": 3}));
        run(&fx, &nb).unwrap();
        let usage = fx.env.pool.usage("__demo_export_concurrency__").unwrap();
        assert_eq!((usage.current, usage.limit), (0, 1));
    }

    #[test]
    fn test_unknown_provider_is_recorded_as_fatal() {
        let fx = fixture();
        let mut nb = notebook(json!({}));
        nb.provider = "missing".into();
        assert!(run(&fx, &nb).is_err());
        let entry = fx.ledger.get("demo", fx.period).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::FatalError);
        assert!(entry.info.unwrap().contains("missing"));
    }

    #[test]
    fn test_pool_sets_merge_and_dedupe() {
        let pool = ResourcePool::from_limits([("flows", 10), ("api", 2)]);
        let mut nb = notebook(json!({"pools": ["api", "flows"]}));
        nb.work.pools = vec!["flows".into()];
        let pools = StagePools::for_notebook(&nb, &pool);
        assert_eq!(pools.export, vec!["flows", "api", "__demo_export_concurrency__"]);
        assert_eq!(pools.load, vec!["flows"]);
        assert_eq!(pools.all().len(), 3);
    }

    #[test]
    fn test_unserializable_payload_becomes_null() {
        let bad = std::collections::BTreeMap::from([((1, 2), 3)]);
        assert_eq!(to_json("demo", &bad), Value::Null);
        assert_eq!(to_json("demo", &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_period_text_formats_windows() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let window = PeriodWindow {
            start,
            end,
            periods: vec![start, end],
        };
        assert_eq!(period_text(&window), "2024-01-01T00-00-00 2024-01-02T00-00-00");
    }
}
