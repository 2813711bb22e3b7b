//! Flow definitions and the ETL run driven by the executor.
//!
//! A [`Notebook`] describes one flow. On every order tick the
//! [`FlowOrderer`] asks the due-work calculator which periods are ready,
//! groups them into windows and wraps a [`FlowRun`] for each window in an
//! [`IterationTask`](crate::core::IterationTask).

pub mod builtin;
pub mod notebook;
pub mod order;
pub mod registry;
pub mod run;
pub mod stage;

pub use builtin::{DefaultTransform, FakeDataExport, JsonlLoad, MemoryLoad, MemoryStore};
pub use notebook::{Notebook, SchedulePolicy, StagePolicy, WorkPolicy, NOTEBOOK_SUFFIX};
pub use order::{DirNotebookSource, FlowOrderer, NotebookSource, StaticNotebooks};
pub use registry::{StageRegistry, Stages};
pub use run::{FlowEnv, FlowRun, RunContext, StagePools, SOFT_TIME_LIMIT_INFO};
pub use stage::{Export, ExportBatch, ExportItem, Load, Row, StageContext, StageParams, Transform, TransformedBatch};
