//! Provider registry keyed by resource type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::file::FileProvider;
use super::noop::NoopProvider;
use super::traits::ResourceProvider;

/// Maps type tags to the providers that manage them.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `noop` and `file` providers.
    ///
    /// `root` is the directory the `file` provider writes under.
    #[must_use]
    pub fn with_builtins(root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoopProvider::new()));
        registry.register(Arc::new(FileProvider::new(root)));
        registry
    }

    /// Registers a provider, replacing any previous one for the same type.
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        let resource_type = provider.resource_type().to_string();
        debug!("Registering provider for type '{}'", resource_type);
        self.providers.insert(resource_type, provider);
    }

    /// Looks up the provider for a type tag.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(resource_type).cloned()
    }

    /// Returns true if a provider is registered for the type tag.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Returns the registered type tags in sorted order.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}
