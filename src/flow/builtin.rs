//! Stages registered by [`StageRegistry::with_builtins`](super::StageRegistry::with_builtins).

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use super::stage::{Export, ExportBatch, ExportItem, Load, Row, StageContext, Transform, TransformedBatch};
use crate::core::StageError;

/// Provider key of [`FakeDataExport`].
pub const FAKEDATA_PROVIDER: &str = "fakedata";
/// Storage key of [`MemoryLoad`].
pub const MEMORY_STORAGE: &str = "memory";
/// Storage key of [`JsonlLoad`].
pub const JSONL_STORAGE: &str = "jsonl";

/// Number of batches the fake export splits its rows into.
const FAKEDATA_BATCHES: usize = 5;
const DEFAULT_FAKE_ROWS: usize = 10;

/// Deterministic export for demos and tests.
///
/// Parameters: `rows` (default 10), `columns` (default `id`, `name`,
/// `value`), `sleep_between_batches` in seconds, `fail` (`"error"` or
/// `"fatal"`) together with `fail_on_batch` (default 0).
#[derive(Debug)]
pub struct FakeDataExport {
    items: VecDeque<ExportItem>,
    fail: Option<(usize, StageError)>,
    batches_sent: usize,
}

impl FakeDataExport {
    /// Build the export for one window.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Fatal`] for an unknown `fail` kind.
    pub fn new(ctx: &StageContext) -> Result<Self, StageError> {
        let rows: usize = ctx.param("rows").unwrap_or(DEFAULT_FAKE_ROWS);
        let columns: Vec<String> = ctx
            .param("columns")
            .unwrap_or_else(|| vec!["id".into(), "name".into(), "value".into()]);
        let pause = ctx
            .param::<u64>("sleep_between_batches")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let fail = match ctx.param::<String>("fail").as_deref() {
            None => None,
            Some(kind) => {
                let at = ctx.param("fail_on_batch").unwrap_or(0);
                let message = format!("fakedata configured to fail with '{kind}'");
                let err = match kind {
                    "error" => StageError::Failed(message),
                    "fatal" => StageError::Fatal(message),
                    other => return Err(StageError::Fatal(format!("unknown fail kind '{other}'"))),
                };
                Some((at, err))
            }
        };

        let data: Vec<Row> = (0..rows).map(|i| fake_row(ctx, &columns, i)).collect();
        let chunk = (rows / FAKEDATA_BATCHES).max(1);
        let mut items = VecDeque::new();
        for (n, rows) in data.chunks(chunk).enumerate() {
            if n > 0 {
                if let Some(pause) = pause {
                    items.push_back(ExportItem::Sleep(pause));
                }
            }
            items.push_back(ExportItem::Batch(ExportBatch {
                columns: columns.clone(),
                rows: rows.to_vec(),
                export_kwargs: Map::new(),
            }));
        }

        Ok(Self {
            items,
            fail,
            batches_sent: 0,
        })
    }
}

fn fake_row(ctx: &StageContext, columns: &[String], i: usize) -> Row {
    let mut row = Map::new();
    for column in columns {
        let value = match column.as_str() {
            "id" => Value::from(i),
            "period" => Value::from(ctx.start_period.to_rfc3339()),
            "value" => Value::from((i * 7) % 100),
            "name" => Value::from(format!("{}_{i}", ctx.flow)),
            other => Value::from(format!("{other}_{i}")),
        };
        row.insert(column.clone(), value);
    }
    row
}

impl Export for FakeDataExport {
    fn next_item(&mut self) -> Result<Option<ExportItem>, StageError> {
        let item = self.items.pop_front();
        if let Some(ExportItem::Batch(_)) = &item {
            if let Some((at, err)) = &self.fail {
                if self.batches_sent >= *at {
                    return Err(err.clone());
                }
            }
            self.batches_sent += 1;
        }
        Ok(item)
    }
}

/// Row validation shared by every provider without its own transform.
///
/// A row is rejected when a declared column is missing or null. The batch
/// size is the byte length of the valid rows serialized as JSON.
#[derive(Debug, Default)]
pub struct DefaultTransform;

impl Transform for DefaultTransform {
    fn transform(&mut self, batch: ExportBatch) -> Result<TransformedBatch, StageError> {
        let mut out = TransformedBatch {
            columns: batch.columns,
            ..TransformedBatch::default()
        };
        for row in batch.rows {
            let complete = out
                .columns
                .iter()
                .all(|column| row.get(column).is_some_and(|value| !value.is_null()));
            let text = serde_json::to_string(&row).map_err(|e| StageError::Failed(e.to_string()))?;
            if complete {
                out.size += text.len();
                out.rows.push(row);
            } else {
                out.data_errors.push(text);
            }
        }
        Ok(out)
    }
}

/// Shared in-process storage written by [`MemoryLoad`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, MemoryTable>>>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Vec<Row>,
    opens: usize,
    closes: usize,
}

impl MemoryStore {
    /// Rows loaded for a flow.
    #[must_use]
    pub fn rows(&self, flow: &str) -> Vec<Row> {
        self.inner.lock().get(flow).map(|t| t.rows.clone()).unwrap_or_default()
    }

    /// How many times a load for `flow` was opened and closed.
    #[must_use]
    pub fn sessions(&self, flow: &str) -> (usize, usize) {
        self.inner.lock().get(flow).map_or((0, 0), |t| (t.opens, t.closes))
    }

    fn with_table<R>(&self, flow: &str, f: impl FnOnce(&mut MemoryTable) -> R) -> R {
        f(self.inner.lock().entry(flow.to_string()).or_default())
    }
}

/// Load into a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryLoad {
    flow: String,
    store: MemoryStore,
}

impl MemoryLoad {
    /// Load for one flow.
    #[must_use]
    pub fn new(flow: impl Into<String>, store: MemoryStore) -> Self {
        Self {
            flow: flow.into(),
            store,
        }
    }
}

impl Load for MemoryLoad {
    fn open(&mut self) -> Result<(), StageError> {
        self.store.with_table(&self.flow, |t| t.opens += 1);
        Ok(())
    }

    fn load(&mut self, batch: &TransformedBatch) -> Result<(), StageError> {
        self.store
            .with_table(&self.flow, |t| t.rows.extend(batch.rows.iter().cloned()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), StageError> {
        self.store.with_table(&self.flow, |t| t.closes += 1);
        Ok(())
    }
}

/// Appends rows as JSON lines to `<storage_dir>/<file>`, where `file`
/// defaults to `<flow>.jsonl`.
#[derive(Debug)]
pub struct JsonlLoad {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlLoad {
    /// Load for one window.
    #[must_use]
    pub fn new(ctx: &StageContext) -> Self {
        let file = ctx
            .param::<String>("file")
            .unwrap_or_else(|| format!("{}.jsonl", ctx.flow));
        Self {
            path: ctx.storage_dir.join(file),
            writer: None,
        }
    }

    /// Target file.
    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }
}

fn io_error(err: &std::io::Error) -> StageError {
    StageError::Failed(err.to_string())
}

impl Load for JsonlLoad {
    fn open(&mut self) -> Result<(), StageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(&e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn load(&mut self, batch: &TransformedBatch) -> Result<(), StageError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StageError::Failed("jsonl load used before open".into()))?;
        for row in &batch.rows {
            let line = serde_json::to_string(row).map_err(|e| StageError::Failed(e.to_string()))?;
            writeln!(writer, "{line}").map_err(|e| io_error(&e))?;
        }
        debug!(path = %self.path.display(), rows = batch.rows.len(), "rows appended");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StageError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| io_error(&e))?;
        }
        Ok(())
    }
}
