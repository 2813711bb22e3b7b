//! # FlowMaster
//!
//! A scheduling and execution engine for recurring data-pipeline flows.
//!
//! Each flow is described by a notebook: a schedule, the resource pools it
//! draws from and its Export, Transform and Load stages. FlowMaster keeps a
//! ledger with one row per `(flow, period)`, computes which periods are due
//! (new periods, gaps, retries, backfills), groups them into windows and runs
//! one task per window on a fixed worker pool.
//!
//! ## Key Pieces
//!
//! - **Resource pools**: named counters with all-or-nothing acquisition
//! - **Iteration tasks**: step-wise tasks that suspend on a sleep or a pool
//!   wait instead of blocking a worker
//! - **Executor**: worker threads plus a scheduler loop that wakes parked
//!   tasks and calls the ordering function
//! - **Ledger**: SQLite or in-memory store of period status
//! - **Due work**: circuit breaker, bootstrap, gap fill, retry and backfill
//!
//! ```rust,ignore
//! use flowmaster::builders::EngineBuilder;
//! use flowmaster::config::{ExecutorConfig, Settings};
//!
//! let settings = Settings::from_env();
//! settings.init_dirs()?;
//! let engine = EngineBuilder::new(settings, ExecutorConfig::new().with_workers(4)).build()?;
//! flowmaster::runtime::run_until_signal(&engine).await?;
//! ```
//!
//! See `tests/flow_test.rs` for a complete run driven by a manual clock.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders that wire an engine from configuration.
pub mod builders;
/// Configuration models for pools, the executor and process paths.
pub mod config;
/// Scheduling primitives: pools, directives, tasks, schedules and the executor.
pub mod core;
/// Flow notebooks, stages and the ETL run.
pub mod flow;
/// Storage backends for the flow ledger.
pub mod infra;
/// Process runtime and operator API.
pub mod runtime;
/// Shared utilities.
pub mod util;
