//! Configuration models for pools, the executor, and process paths.

pub mod executor;
pub mod pool;
pub mod settings;

pub use executor::ExecutorConfig;
pub use pool::{PoolsConfig, DEFAULT_FLOWS_LIMIT, DEFAULT_FLOWS_POOL};
pub use settings::{Settings, HOME_ENV};
