//! Adapter registry for resolving a provider kind to its adapter.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::ProviderAdapter;
use crate::google::{GoogleAdapter, GoogleConfig};
use crate::icloud::{ICloudAdapter, ICloudConfig};
use calvault_common::{Error, ProviderKind, Result};

/// Registry of provider adapters.
///
/// Built once at startup; the scheduler and refresher resolve adapters
/// through it by the provider kind stored with each account.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    /// The Google adapter again, for the consent flow it alone offers.
    google: Option<Arc<GoogleAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind.
    ///
    /// # Errors
    /// - Returns error if the kind is already registered
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let kind = adapter.kind();
        if self.adapters.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Adapter for '{}' is already registered",
                kind
            )));
        }
        self.adapters.insert(kind, adapter);
        Ok(())
    }

    /// Resolve the adapter for `kind`.
    ///
    /// # Errors
    /// - `NotFound` if no adapter is registered
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No adapter registered for '{}'", kind)))
    }

    /// Register the Google adapter, keeping it reachable for the
    /// consent flow.
    ///
    /// # Errors
    /// - Returns error if Google is already registered
    pub fn register_google(&mut self, adapter: Arc<GoogleAdapter>) -> Result<()> {
        self.register(adapter.clone())?;
        self.google = Some(adapter);
        Ok(())
    }

    /// The registered Google adapter.
    ///
    /// # Errors
    /// - `NotFound` if Google was not registered with
    ///   [`AdapterRegistry::register_google`]
    pub fn google(&self) -> Result<Arc<GoogleAdapter>> {
        self.google
            .clone()
            .ok_or_else(|| Error::NotFound("No Google adapter registered".to_string()))
    }

    /// Registered provider kinds.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Registry with the iCloud and Google adapters.
    pub fn with_defaults(icloud: ICloudConfig, google: GoogleConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(ICloudAdapter::new(icloud)?))?;
        registry.register_google(Arc::new(GoogleAdapter::new(google)?))?;
        Ok(registry)
    }
}
