//! Backend registry: resolves fallback-chain ids to backend instances.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_config::BackendsConfig;
use cadence_core::backend::Backend;
use cadence_core::error::BackendError;
use tracing::debug;

use crate::manager::{BreakerPolicy, ModelManager};
use crate::rule_table::RuleTableBackend;

/// Named backends available for building a fallback chain.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    /// Get a specific backend by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(id).cloned()
    }

    /// List all registered backend ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Build a model manager whose chain follows `chain` exactly.
    pub fn build_manager(
        &self,
        chain: &[String],
        policy: BreakerPolicy,
    ) -> Result<ModelManager, BackendError> {
        if chain.is_empty() {
            return Err(BackendError::NotConfigured("fallback chain is empty".into()));
        }

        let mut manager = ModelManager::new(policy);
        for id in chain {
            let backend = self
                .get(id)
                .ok_or_else(|| BackendError::UnknownBackend(id.clone()))?;
            manager = manager.add(backend);
        }
        debug!(chain = ?chain, "Model manager built");
        Ok(manager)
    }
}

/// Register every configured rule table. Other backends (remote models,
/// local inference) are registered by the embedding application.
pub fn build_from_config(config: &BackendsConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for table in &config.rule_tables {
        registry.register(Arc::new(RuleTableBackend::from_config(table)));
    }
    registry
}
