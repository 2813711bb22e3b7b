//! Process-level paths rooted at `FLOWMASTER_HOME`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use super::PoolsConfig;

/// Environment variable naming the home directory.
pub const HOME_ENV: &str = "FLOWMASTER_HOME";

/// Filesystem layout of one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Root directory.
    pub home: PathBuf,
    /// Ledger database.
    pub db_path: PathBuf,
    /// Directory scanned for `*.flow.json` notebooks.
    pub notebooks_dir: PathBuf,
    /// Root for file-based storages.
    pub storage_dir: PathBuf,
    /// Per-run log files.
    pub logs_dir: PathBuf,
    /// Pool limits.
    pub pools_path: PathBuf,
}

impl Settings {
    /// Layout under an explicit home directory.
    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            db_path: home.join("db.sqlite"),
            notebooks_dir: home.join("notebooks"),
            storage_dir: home.join("storage"),
            logs_dir: home.join("logs"),
            pools_path: home.join("pools.json"),
            home,
        }
    }

    /// Resolve the home from `.env` and the environment, falling back to
    /// `$HOME/FlowMaster`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let home = std::env::var_os(HOME_ENV).map_or_else(
            || {
                std::env::var_os("HOME")
                    .map_or_else(|| PathBuf::from("."), PathBuf::from)
                    .join("FlowMaster")
            },
            PathBuf::from,
        );
        Self::with_home(home)
    }

    /// Create the directory tree and a starter `pools.json` if missing.
    pub fn init_dirs(&self) -> Result<(), String> {
        for dir in [&self.home, &self.notebooks_dir, &self.storage_dir, &self.logs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        }
        if !self.pools_path.exists() {
            let body = serde_json::to_string_pretty(&PoolsConfig::starter())
                .map_err(|e| format!("serialize pools: {e}"))?;
            write_file(&self.pools_path, &body)?;
        }
        info!(home = %self.home.display(), "flowmaster home initialized");
        Ok(())
    }

    /// Load pool limits from `pools_path`.
    pub fn load_pools(&self) -> Result<PoolsConfig, String> {
        PoolsConfig::load(&self.pools_path)
    }
}

fn write_file(path: &Path, body: &str) -> Result<(), String> {
    std::fs::write(path, body).map_err(|e| format!("write {}: {e}", path.display()))
}
