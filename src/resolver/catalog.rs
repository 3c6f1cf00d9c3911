//! Static locator lists: version-tagged candidates and last-resort fallbacks.

use crate::config::{EndMarkerSpec, ProviderCatalog};
use crate::model::{Locator, ResolutionKey};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::info;

/// Version tag consulted when neither a detected nor a default version applies.
pub const FALLBACK_VERSION: &str = "default";

/// Per-namespace catalogs plus the UI version detected for each namespace.
#[derive(Debug, Default)]
pub struct LocatorCatalog {
    providers: HashMap<String, ProviderCatalog>,
    detected: RwLock<HashMap<String, String>>,
}

impl LocatorCatalog {
    pub fn new(providers: HashMap<String, ProviderCatalog>) -> Self {
        Self {
            providers,
            detected: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self, namespace: &str) -> Option<&ProviderCatalog> {
        self.providers.get(namespace)
    }

    /// Record the UI version detected for `namespace`.
    pub fn set_version(&self, namespace: &str, tag: impl Into<String>) {
        let tag = tag.into();
        info!("Detected {} UI version: {}", namespace, tag);
        self.detected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), tag);
    }

    /// Version tag whose locators apply to `namespace`: the detected tag if the
    /// catalog knows it, else the provider's default, else [`FALLBACK_VERSION`].
    pub fn active_version(&self, namespace: &str) -> Option<String> {
        let provider = self.providers.get(namespace)?;
        let detected = self
            .detected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned();
        [detected, provider.default_version.clone(), Some(FALLBACK_VERSION.to_string())]
            .into_iter()
            .flatten()
            .find(|tag| provider.versions.contains_key(tag))
    }

    /// Ordered, most-specific-first locators for the active version.
    pub fn versioned(&self, key: &ResolutionKey) -> Vec<Locator> {
        let Some(version) = self.active_version(&key.namespace) else {
            return Vec::new();
        };
        self.providers
            .get(&key.namespace)
            .and_then(|p| p.versions.get(&version))
            .and_then(|targets| targets.get(&key.target_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn emergency(&self, key: &ResolutionKey) -> Vec<Locator> {
        self.providers
            .get(&key.namespace)
            .and_then(|p| p.emergency.get(&key.target_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn anchors(&self, key: &ResolutionKey) -> Vec<String> {
        self.providers
            .get(&key.namespace)
            .and_then(|p| p.anchors.get(&key.target_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn end_markers(&self, key: &ResolutionKey) -> Vec<EndMarkerSpec> {
        self.providers
            .get(&key.namespace)
            .and_then(|p| p.end_markers.get(&key.target_id))
            .cloned()
            .unwrap_or_default()
    }
}
