//! # eoka-resolver
//!
//! Resilient element resolution for chat-UI automation. Find "the element I
//! need right now" on pages whose markup shifts between releases, cache the
//! answer safely, and tell when a streaming response has stopped changing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eoka_resolver::{
//!     CandidateStore, Config, LayeredResolver, MemoryKv, RequestCoordinator, ResolutionKey,
//!     ResolveOptions,
//! };
//!
//! # async fn run(driver: Arc<dyn eoka_resolver::Driver>) -> eoka_resolver::Result<()> {
//! let config = Config::load("resolver.yaml")?;
//! let store = CandidateStore::new(Arc::new(MemoryKv::new()), config.cache.clone());
//! let resolver = LayeredResolver::new(driver, store, &config);
//! let coordinator = RequestCoordinator::new(resolver, &config.resolver);
//!
//! let key = ResolutionKey::new("chatgpt", "composer");
//! let found = coordinator.resolve(&key, ResolveOptions::default()).await?;
//! println!("{} via {}", found.record.locator, found.layer());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod fingerprint;
pub mod metrics;
pub mod model;
#[cfg(feature = "eoka")]
pub mod page;
pub mod resolver;
pub mod scorer;
pub mod stabilize;
pub mod store;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, EndMarkerSpec, ProviderCatalog, ResolverConfig, StabilizeConfig};
pub use coordinator::RequestCoordinator;
pub use driver::{
    ChangeEvent, ChangeFeed, Driver, DriverText, EndMarker, Heuristic, HeuristicMatch, Subscription, TextSource,
};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, TracingMetrics};
pub use model::{
    CacheEntry, CandidateRecord, Fingerprint, Layer, LiveCandidate, Locator, NodeFeatures, ResolutionKey,
};
pub use resolver::{
    FailureKind, LayerStats, LayerTrace, LayeredResolver, LocatorCatalog, Resolution, ResolutionTrace,
    ResolveOptions,
};
pub use scorer::ConfidenceScorer;
pub use stabilize::{StabilizationWatcher, StabilizeStatus, Stabilized, TextOrigin};
pub use store::{CandidateStore, FileKv, KvStore, Lookup, MemoryKv};

// Shared by the coordinator, resolver and watcher as the "stop all work" signal.
pub use tokio_util::sync::CancellationToken;

/// Result type for eoka-resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine and its capabilities.
///
/// `Clone` so a single in-flight resolution can hand the same outcome to every
/// queued caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(Arc<serde_yaml::Error>),

    #[error("json error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("invalid locator syntax: {0}")]
    InvalidLocatorSyntax(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not interactable: {0}")]
    NotInteractable(String),

    #[error("all layers exhausted for {}", .0.key)]
    AllLayersExhausted(Box<ResolutionTrace>),

    #[error("timeout: {key} unresolved after {after_ms}ms")]
    Timeout { key: ResolutionKey, after_ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Diagnostic trace, when the error carries one.
    pub fn trace(&self) -> Option<&ResolutionTrace> {
        match self {
            Error::AllLayersExhausted(trace) => Some(trace),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

#[cfg(feature = "eoka")]
impl From<eoka::Error> for Error {
    fn from(e: eoka::Error) -> Self {
        Error::Driver(e.to_string())
    }
}
