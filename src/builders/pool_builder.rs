//! Build the shared pool table from pool configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::PoolsConfig;
use crate::core::{ResourcePool, SchedulerError};

/// Build the pool table after validating the configuration.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] if a limit is invalid.
pub fn build_pool(cfg: &PoolsConfig) -> Result<Arc<ResourcePool>, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("pools invalid: {e}")))?;

    let pool = ResourcePool::from_limits(cfg.limits.iter().map(|(name, limit)| (name.clone(), *limit)));
    info!(pool_count = cfg.limits.len(), "pools configured");
    Ok(Arc::new(pool))
}
