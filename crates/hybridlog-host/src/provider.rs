//! Store providers and the registry hosts resolve them from.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use hybridlog_core::{Config, Store};

use crate::error::{HostError, HostResult};
use crate::store::KvStore;

/// Something that can open a store at a path.
pub trait StoreProvider: Send + Sync {
    /// Registry key
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn get_store(&self, path: &Path) -> HostResult<Box<dyn KvStore>>;
}

/// Provider over the HybridLog engine.
#[derive(Debug, Clone, Default)]
pub struct HybridLogProvider {
    config: Config,
}

impl HybridLogProvider {
    pub const NAME: &'static str = "HybridLogStore";

    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl StoreProvider for HybridLogProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Uses a checkpointed hybrid log to store data."
    }

    fn get_store(&self, path: &Path) -> HostResult<Box<dyn KvStore>> {
        let store = Store::open(path, self.config.clone())?;
        tracing::debug!(provider = Self::NAME, path = %path.display(), "store opened by provider");
        Ok(Box::new(store))
    }
}

/// Providers by name.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn StoreProvider>>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { providers: RwLock::new(HashMap::new()) }
    }

    /// A registry holding the HybridLog provider with the default config.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.providers.write().insert(
            HybridLogProvider::NAME.to_string(),
            Arc::new(HybridLogProvider::default()),
        );
        registry
    }

    /// Add a provider. Names are unique.
    pub fn register(&self, provider: Arc<dyn StoreProvider>) -> HostResult<()> {
        let mut providers = self.providers.write();
        let name = provider.name().to_string();
        if providers.contains_key(&name) {
            return Err(HostError::DuplicateProvider(name));
        }
        tracing::debug!(provider = %name, "store provider registered");
        providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StoreProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a store with the provider registered as `name`.
    pub fn open(&self, name: &str, path: &Path) -> HostResult<Box<dyn KvStore>> {
        let provider = self.get(name).ok_or_else(|| HostError::UnknownProvider(name.to_string()))?;
        provider.get_store(path)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry").field("providers", &self.names()).finish()
    }
}
