//! Explicit registry of stage factories keyed by provider and storage name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::builtin::{
    DefaultTransform, FakeDataExport, JsonlLoad, MemoryLoad, MemoryStore, FAKEDATA_PROVIDER, JSONL_STORAGE,
    MEMORY_STORAGE,
};
use super::stage::{Export, Load, StageContext, StageParams, Transform};
use crate::core::StageError;

/// Builds an export for one window.
pub type ExportFactory = Arc<dyn Fn(&StageContext) -> Result<Box<dyn Export>, StageError> + Send + Sync>;
/// Builds a transform for one window.
pub type TransformFactory = Arc<dyn Fn(&StageContext) -> Result<Box<dyn Transform>, StageError> + Send + Sync>;
/// Builds a load for one window.
pub type LoadFactory = Arc<dyn Fn(&StageContext) -> Result<Box<dyn Load>, StageError> + Send + Sync>;

/// The three stages of one run.
pub struct Stages {
    /// Row source.
    pub export: Box<dyn Export>,
    /// Row validation.
    pub transform: Box<dyn Transform>,
    /// Storage writer.
    pub load: Box<dyn Load>,
}

impl fmt::Debug for Stages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stages").finish_non_exhaustive()
    }
}

/// Provider and storage lookup.
///
/// Exports and transforms are keyed by provider, loads by storage. A provider
/// without its own transform uses [`DefaultTransform`].
#[derive(Clone, Default)]
pub struct StageRegistry {
    exports: BTreeMap<String, ExportFactory>,
    transforms: BTreeMap<String, TransformFactory>,
    loads: BTreeMap<String, LoadFactory>,
    memory: MemoryStore,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("providers", &self.exports.keys().collect::<Vec<_>>())
            .field("storages", &self.loads.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StageRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `fakedata`, `memory` and `jsonl`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_export(FAKEDATA_PROVIDER, |ctx| {
            Ok(Box::new(FakeDataExport::new(ctx)?) as Box<dyn Export>)
        });
        let store = registry.memory.clone();
        registry.register_load(MEMORY_STORAGE, move |ctx| {
            Ok(Box::new(MemoryLoad::new(ctx.flow.clone(), store.clone())) as Box<dyn Load>)
        });
        registry.register_load(JSONL_STORAGE, |ctx| Ok(Box::new(JsonlLoad::new(ctx)) as Box<dyn Load>));
        registry
    }

    /// Register or replace an export provider.
    pub fn register_export<F>(&mut self, provider: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StageContext) -> Result<Box<dyn Export>, StageError> + Send + Sync + 'static,
    {
        self.exports.insert(provider.into(), Arc::new(factory));
        self
    }

    /// Register a provider-specific transform.
    pub fn register_transform<F>(&mut self, provider: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StageContext) -> Result<Box<dyn Transform>, StageError> + Send + Sync + 'static,
    {
        self.transforms.insert(provider.into(), Arc::new(factory));
        self
    }

    /// Register or replace a storage.
    pub fn register_load<F>(&mut self, storage: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StageContext) -> Result<Box<dyn Load>, StageError> + Send + Sync + 'static,
    {
        self.loads.insert(storage.into(), Arc::new(factory));
        self
    }

    /// Whether a provider is registered.
    #[must_use]
    pub fn has_provider(&self, provider: &str) -> bool {
        self.exports.contains_key(provider)
    }

    /// Whether a storage is registered.
    #[must_use]
    pub fn has_storage(&self, storage: &str) -> bool {
        self.loads.contains_key(storage)
    }

    /// Store behind the built-in `memory` storage.
    #[must_use]
    pub fn memory_store(&self) -> MemoryStore {
        self.memory.clone()
    }

    /// Instantiate all three stages for one window, each with its own
    /// section of `params`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Fatal`] for an unknown provider or storage, and
    /// whatever the factories return.
    pub fn build(&self, ctx: &StageContext, params: &StageParams) -> Result<Stages, StageError> {
        let export = self
            .exports
            .get(&ctx.provider)
            .ok_or_else(|| StageError::Fatal(format!("unknown provider '{}'", ctx.provider)))?;
        let load = self
            .loads
            .get(&ctx.storage)
            .ok_or_else(|| StageError::Fatal(format!("unknown storage '{}'", ctx.storage)))?;
        let transform = match self.transforms.get(&ctx.provider) {
            Some(factory) => factory(&ctx.with_params(&params.transform))?,
            None => Box::new(DefaultTransform),
        };
        Ok(Stages {
            export: export(&ctx.with_params(&params.export))?,
            transform,
            load: load(&ctx.with_params(&params.load))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn ctx(provider: &str, storage: &str) -> StageContext {
        StageContext {
            flow: "demo".into(),
            provider: provider.into(),
            storage: storage.into(),
            start_period: Utc::now(),
            end_period: Utc::now(),
            params: json!({}),
            storage_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = StageRegistry::with_builtins();
        assert!(registry.has_provider("fakedata"));
        assert!(registry.has_storage("memory"));
        assert!(registry.has_storage("jsonl"));
        assert!(registry.build(&ctx("fakedata", "memory"), &StageParams::default()).is_ok());
    }

    #[test]
    fn test_unknown_provider_is_fatal() {
        let registry = StageRegistry::with_builtins();
        let err = registry.build(&ctx("nope", "memory"), &StageParams::default()).unwrap_err();
        assert!(err.is_fatal());
        let err = registry.build(&ctx("fakedata", "nope"), &StageParams::default()).unwrap_err();
        assert!(err.is_fatal());
    }
}
