//! Export, Transform and Load contracts.
//!
//! A flow run drives one instance of each stage per window. Stages are plain
//! synchronous objects; suspension is requested through [`ExportItem::Sleep`]
//! and pool waits are inserted by the run itself.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::StageError;

/// One exported or transformed record.
pub type Row = Map<String, Value>;

/// Everything a stage factory may need to build a stage for one window.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Flow name.
    pub flow: String,
    /// Export provider key.
    pub provider: String,
    /// Load storage key.
    pub storage: String,
    /// First period of the window.
    pub start_period: DateTime<Utc>,
    /// Last period of the window.
    pub end_period: DateTime<Utc>,
    /// Parameters of the stage being built.
    pub params: Value,
    /// Root directory for file-based storages.
    pub storage_dir: PathBuf,
}

impl StageContext {
    /// Same context with another stage's parameters.
    #[must_use]
    pub fn with_params(&self, params: &Value) -> Self {
        Self {
            params: params.clone(),
            ..self.clone()
        }
    }

    /// Read an optional parameter, ignoring values of the wrong type.
    #[must_use]
    pub fn param<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Parameters of each stage section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageParams {
    /// Export parameters.
    pub export: Value,
    /// Transform parameters.
    pub transform: Value,
    /// Load parameters.
    pub load: Value,
}

/// Item produced by an export.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportItem {
    /// A batch of rows.
    Batch(ExportBatch),
    /// Pause the run before asking for the next item.
    Sleep(Duration),
}

/// Rows produced by one export call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportBatch {
    /// Column names in export order.
    pub columns: Vec<String>,
    /// Exported rows.
    pub rows: Vec<Row>,
    /// Arguments the export used, recorded in the run context.
    pub export_kwargs: Map<String, Value>,
}

/// Rows ready for loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformedBatch {
    /// Estimated size in bytes.
    pub size: usize,
    /// Columns to insert.
    pub columns: Vec<String>,
    /// Valid rows.
    pub rows: Vec<Row>,
    /// Rows rejected by validation, rendered as text.
    pub data_errors: Vec<String>,
}

/// Source of rows for one window.
pub trait Export: Send {
    /// Next item, or `None` once the window is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the source fails.
    fn next_item(&mut self) -> Result<Option<ExportItem>, StageError>;
}

/// Validation and reshaping of exported rows.
pub trait Transform: Send {
    /// Transform one batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the batch cannot be processed at all.
    fn transform(&mut self, batch: ExportBatch) -> Result<TransformedBatch, StageError>;
}

/// Scoped storage writer. `open` and `close` are each called once per run.
pub trait Load: Send {
    /// Acquire the storage resource.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the storage is unavailable.
    fn open(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Write one batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the write fails.
    fn load(&mut self, batch: &TransformedBatch) -> Result<(), StageError>;

    /// Release the storage resource.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when flushing fails.
    fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}
