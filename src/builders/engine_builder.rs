//! Assemble ledger, pools, stage registry, orderer and executor.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::pool_builder::build_pool;
use crate::config::{ExecutorConfig, PoolsConfig, Settings};
use crate::core::{AppResult, Executor, ResourcePool};
use crate::flow::{DirNotebookSource, FlowEnv, FlowOrderer, NotebookSource, StageRegistry};
use crate::infra::ledger::{InMemoryLedger, LedgerStore, SqliteLedger};
use crate::util::{Clock, SystemClock};

/// A wired engine, ready to start.
pub struct Engine {
    /// Ledger shared by the orderer and every run.
    pub ledger: Arc<dyn LedgerStore>,
    /// Pool table.
    pub pool: Arc<ResourcePool>,
    /// Stage factories.
    pub registry: Arc<StageRegistry>,
    /// Engine clock.
    pub clock: Arc<dyn Clock>,
    /// Worker pool and scheduler.
    pub executor: Executor,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pool", &self.pool)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
///
/// Defaults: pools from `settings.pools_path`, the SQLite ledger at
/// `settings.db_path` (an in-memory ledger in dry-run mode), notebooks from
/// `settings.notebooks_dir`, built-in stages and the system clock.
pub struct EngineBuilder {
    settings: Settings,
    executor: ExecutorConfig,
    pools: Option<PoolsConfig>,
    ledger: Option<Arc<dyn LedgerStore>>,
    registry: Option<StageRegistry>,
    clock: Option<Arc<dyn Clock>>,
    source: Option<Box<dyn NotebookSource>>,
}

impl EngineBuilder {
    /// Start from the given layout and executor configuration.
    #[must_use]
    pub fn new(settings: Settings, executor: ExecutorConfig) -> Self {
        Self {
            settings,
            executor,
            pools: None,
            ledger: None,
            registry: None,
            clock: None,
            source: None,
        }
    }

    /// Use these pool limits instead of reading `pools.json`.
    #[must_use]
    pub fn with_pools(mut self, pools: PoolsConfig) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Use this ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use this stage registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Read notebooks from this source.
    #[must_use]
    pub fn with_notebooks(mut self, source: impl NotebookSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Wire everything and recover entries left behind by a previous process.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the ledger cannot be opened.
    pub fn build(self) -> AppResult<Engine> {
        let pools = match self.pools {
            Some(pools) => pools,
            None => self.settings.load_pools().map_err(anyhow::Error::msg)?,
        };
        let pool = build_pool(&pools)?;

        let ledger: Arc<dyn LedgerStore> = match self.ledger {
            Some(ledger) => ledger,
            None if self.executor.dry_run => Arc::new(InMemoryLedger::new()),
            None => Arc::new(
                SqliteLedger::open(&self.settings.db_path)
                    .with_context(|| format!("open ledger {}", self.settings.db_path.display()))?,
            ),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let lost = ledger.clear_lost_entries(clock.now())?;
        info!(reverted = lost.reverted, expired = lost.expired, "lost entries recovered");

        let registry = Arc::new(self.registry.unwrap_or_else(StageRegistry::with_builtins));
        let env = FlowEnv {
            ledger: Arc::clone(&ledger),
            registry: Arc::clone(&registry),
            pool: Arc::clone(&pool),
            clock: Arc::clone(&clock),
            storage_dir: self.settings.storage_dir.clone(),
            logs_dir: Some(self.settings.logs_dir.clone()),
        };
        let source: Box<dyn NotebookSource> = match self.source {
            Some(source) => source,
            None => Box::new(DirNotebookSource::new(self.settings.notebooks_dir.clone())),
        };
        let orderer = FlowOrderer::new(source, env).with_dry_run(self.executor.dry_run);
        let executor = Executor::new(self.executor, orderer)?;

        Ok(Engine {
            ledger,
            pool,
            registry,
            clock,
            executor,
        })
    }
}
