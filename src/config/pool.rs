//! Admission pool configuration (`pools.json`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Name of the pool every flow joins unless it says otherwise.
pub const DEFAULT_FLOWS_POOL: &str = "flows";

/// Limit used for [`DEFAULT_FLOWS_POOL`] in a fresh installation.
pub const DEFAULT_FLOWS_LIMIT: u32 = 100;

/// `name -> limit` mapping loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolsConfig {
    /// Pool limits by name.
    pub limits: BTreeMap<String, u32>,
}

impl PoolsConfig {
    /// Configuration written by `flowmaster init`.
    #[must_use]
    pub fn starter() -> Self {
        Self {
            limits: BTreeMap::from([(DEFAULT_FLOWS_POOL.to_string(), DEFAULT_FLOWS_LIMIT)]),
        }
    }

    /// Add or replace one pool.
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, limit: u32) -> Self {
        self.limits.insert(name.into(), limit);
        self
    }

    /// Validate pool names and limits.
    pub fn validate(&self) -> Result<(), String> {
        for (name, limit) in &self.limits {
            if name.trim().is_empty() {
                return Err("pool name must not be empty".into());
            }
            if *limit == 0 {
                return Err(format!("pool `{name}` limit must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Parse pool configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file. A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(input) => Self::from_json_str(&input),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(format!("read {}: {e}", path.display())),
        }
    }
}
