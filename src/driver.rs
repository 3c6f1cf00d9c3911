//! Capability seams the engine calls into.
//!
//! The core never inspects how a locator is matched against a live page. A
//! browser adapter (see the `eoka` feature) or a test fake implements these.

use crate::fingerprint;
use crate::model::{Fingerprint, LiveCandidate, Locator, ResolutionKey};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Locates and validates live candidates.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Resolve `locator` within `scope` (whole document when `None`).
    ///
    /// `Ok(None)` means no match. A malformed locator should be reported as
    /// [`Error::InvalidLocatorSyntax`](crate::Error::InvalidLocatorSyntax).
    async fn locate(&self, locator: &Locator, scope: Option<&Locator>) -> Result<Option<LiveCandidate>>;

    /// Whether `candidate` is fit to be used as `key`'s target (visible,
    /// enabled, not excluded by context).
    async fn validate(&self, key: &ResolutionKey, candidate: &LiveCandidate) -> bool;

    /// Fingerprint to store alongside a freshly accepted candidate.
    fn describe_fingerprint(&self, candidate: &LiveCandidate) -> Fingerprint {
        fingerprint::capture(candidate)
    }

    /// Locator to store alongside a freshly accepted candidate.
    fn describe_locator(&self, candidate: &LiveCandidate) -> Locator {
        candidate.locator.clone()
    }

    /// Environment snapshot attached to failure diagnostics.
    async fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }
}

/// A heuristic candidate, optionally carrying its own confidence.
#[derive(Debug, Clone)]
pub struct HeuristicMatch {
    pub candidate: LiveCandidate,
    /// `None` means the heuristic did not score it; the scorer's default applies.
    pub confidence: Option<u8>,
}

impl HeuristicMatch {
    pub fn bare(candidate: LiveCandidate) -> Self {
        Self {
            candidate,
            confidence: None,
        }
    }

    pub fn scored(candidate: LiveCandidate, confidence: u8) -> Self {
        Self {
            candidate,
            confidence: Some(confidence),
        }
    }
}

/// One discovery strategy for a target kind.
#[async_trait]
pub trait Heuristic: Send + Sync {
    /// Short name used in traces and logs.
    fn name(&self) -> &str;

    /// Yield at most one candidate for `key`.
    async fn try_locate(&self, key: &ResolutionKey, hint: Option<&str>) -> Result<Option<HeuristicMatch>>;
}

/// Reads the current text of an observed target.
#[async_trait]
pub trait TextSource: Send + Sync {
    async fn extract(&self, scope: &Locator) -> Result<Option<String>>;
}

/// Boolean predicate that signals a mutating process has finished.
#[async_trait]
pub trait EndMarker: Send + Sync {
    fn describe(&self) -> String;

    async fn satisfied(&self) -> bool;
}

/// A single change notification. Carries no payload; the watcher re-extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent;

/// Push source of change notifications.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, scope: &Locator) -> Subscription;
}

/// Receiving end of a change feed. Dropping it unsubscribes.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            on_drop: Some(Box::new(unsubscribe)),
        }
    }

    /// Subscription with no unsubscribe action.
    pub fn detached(events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { events, on_drop: None }
    }

    /// Next notification, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.on_drop.is_some())
            .finish()
    }
}

/// TextSource that re-locates a locator through a driver on every read.
pub struct DriverText {
    driver: std::sync::Arc<dyn Driver>,
    locator: Locator,
}

impl DriverText {
    pub fn new(driver: std::sync::Arc<dyn Driver>, locator: impl Into<Locator>) -> Self {
        Self {
            driver,
            locator: locator.into(),
        }
    }
}

#[async_trait]
impl TextSource for DriverText {
    async fn extract(&self, scope: &Locator) -> Result<Option<String>> {
        let found = self.driver.locate(&self.locator, Some(scope)).await?;
        Ok(found.map(|c| c.text).filter(|t| !t.trim().is_empty()))
    }
}
