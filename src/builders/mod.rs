//! Builders wiring engine components from configuration.

pub mod engine_builder;
pub mod pool_builder;

pub use engine_builder::{Engine, EngineBuilder};
pub use pool_builder::build_pool;
