//! Layered target resolution.
//!
//! Layers run strictly in order (Cached, Versioned, Heuristic, Emergency) and
//! the first acceptable candidate wins. Every acceptance outside the cache
//! writes a fresh cache entry.

mod catalog;
mod trace;

pub use catalog::{LocatorCatalog, FALLBACK_VERSION};
pub use trace::{Failure, FailureKind, LayerStats, LayerTrace, ResolutionTrace, MAX_FAILURES};

use crate::config::{Config, ResolverConfig};
use crate::driver::{Driver, Heuristic};
use crate::fingerprint;
use crate::metrics::{MetricEvent, MetricsSink, TracingMetrics};
use crate::model::{CandidateRecord, Layer, LiveCandidate, Locator, ResolutionKey};
use crate::scorer::ConfidenceScorer;
use crate::store::{CandidateStore, Lookup};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-call resolution options.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Budget for the heuristic discovery loop (config default when `None`).
    pub timeout: Option<Duration>,
    /// Overall deadline enforced by [`RequestCoordinator`](crate::RequestCoordinator).
    pub deadline: Option<Duration>,
    /// Skip the Cached and Versioned layers.
    pub force_discovery: bool,
    /// Free-form hint passed to heuristics.
    pub hint: Option<String>,
    /// Extra anchor terms, merged with the catalog's.
    pub anchors: Vec<String>,
    /// Scope passed to the driver (whole document when `None`).
    pub scope: Option<Locator>,
}

impl ResolveOptions {
    pub fn force_discovery(mut self) -> Self {
        self.force_discovery = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_anchors<I, S>(mut self, anchors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.anchors.extend(anchors.into_iter().map(Into::into));
        self
    }

    pub fn within(mut self, scope: impl Into<Locator>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// A resolved target.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Layer that resolved this call. For a cache hit this is
    /// [`Layer::Cached`], while `record.layer` keeps the layer that
    /// originally discovered the candidate.
    pub layer: Layer,
    pub record: CandidateRecord,
    pub candidate: LiveCandidate,
    pub trace: ResolutionTrace,
}

impl Resolution {
    pub fn layer(&self) -> Layer {
        self.layer
    }
}

type Accepted = (Layer, CandidateRecord, LiveCandidate);

/// Runs the four resolution layers against one key.
pub struct LayeredResolver {
    driver: Arc<dyn Driver>,
    store: CandidateStore,
    catalog: LocatorCatalog,
    heuristics: HashMap<String, Vec<Arc<dyn Heuristic>>>,
    scorer: ConfidenceScorer,
    config: ResolverConfig,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl LayeredResolver {
    pub fn new(driver: Arc<dyn Driver>, store: CandidateStore, config: &Config) -> Self {
        Self {
            driver,
            store,
            catalog: LocatorCatalog::new(config.providers.clone()),
            heuristics: HashMap::new(),
            scorer: ConfidenceScorer::from_config(&config.resolver),
            config: config.resolver.clone(),
            metrics: Arc::new(TracingMetrics),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a heuristic for a target kind.
    ///
    /// `kind` is either a bare target id (`"composer"`, any namespace) or a
    /// storage key (`"chatgpt::composer"`). Namespaced registrations take
    /// precedence. Strategies run in registration order.
    pub fn with_heuristic(mut self, kind: &str, heuristic: Arc<dyn Heuristic>) -> Self {
        self.heuristics.entry(kind.to_string()).or_default().push(heuristic);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share an external "stop all work" signal.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    pub fn catalog(&self) -> &LocatorCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Record the UI version detected for `namespace`.
    pub fn set_version(&self, namespace: &str, tag: impl Into<String>) {
        self.catalog.set_version(namespace, tag);
    }

    /// Resolve `key`, stopping at the first layer that yields a valid candidate.
    pub async fn resolve(&self, key: &ResolutionKey, opts: &ResolveOptions) -> Result<Resolution> {
        let started = Instant::now();
        let mut trace = ResolutionTrace::new(key.clone());
        let outcome = self.run_layers(key, opts, &mut trace).await;
        trace.duration_ms = elapsed_ms(started);

        match outcome {
            Ok(Some((layer, record, candidate))) => {
                trace.winner = Some(layer);
                trace.locator = Some(record.locator.clone());
                info!(
                    "Resolved {} via {} layer: {} ({}ms)",
                    key, layer, record.locator, trace.duration_ms
                );
                self.metrics.emit(&MetricEvent::Resolved { trace: trace.clone() });
                Ok(Resolution {
                    layer,
                    record,
                    candidate,
                    trace,
                })
            }
            Ok(None) => {
                let snapshot = tokio::time::timeout(
                    Duration::from_millis(self.config.snapshot_timeout_ms),
                    self.driver.snapshot(),
                )
                .await
                .ok()
                .flatten();
                self.metrics.emit(&MetricEvent::Exhausted {
                    trace: trace.clone(),
                    snapshot,
                });
                Err(Error::AllLayersExhausted(Box::new(trace)))
            }
            Err(e) => {
                if matches!(e, Error::Cancelled) {
                    self.metrics.emit(&MetricEvent::Cancelled { key: key.clone() });
                }
                Err(e)
            }
        }
    }

    async fn run_layers(
        &self,
        key: &ResolutionKey,
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
    ) -> Result<Option<Accepted>> {
        if opts.force_discovery {
            debug!("Forced discovery for {}: skipping cached and versioned layers", key);
            trace.skip(Layer::Cached);
            trace.skip(Layer::Versioned);
        } else {
            self.check_cancelled()?;
            if let Some(hit) = self.try_cached(key, opts, trace).await {
                return Ok(Some(hit));
            }

            let locators = self.catalog.versioned(key);
            let confidence = self.config.versioned_confidence;
            if let Some(hit) = self
                .try_static(Layer::Versioned, key, &locators, confidence, opts, trace)
                .await?
            {
                return Ok(Some(hit));
            }
        }

        if let Some(hit) = self.try_heuristic(key, opts, trace).await? {
            return Ok(Some(hit));
        }

        let locators = self.catalog.emergency(key);
        let confidence = self.config.emergency_confidence;
        self.try_static(Layer::Emergency, key, &locators, confidence, opts, trace)
            .await
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn try_cached(
        &self,
        key: &ResolutionKey,
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
    ) -> Option<Accepted> {
        let started = Instant::now();
        let mut stats = LayerStats::default();
        let hit = self.check_cached(key, opts, trace, &mut stats).await;
        if hit.is_some() {
            stats.success += 1;
        }
        stats.duration_ms = elapsed_ms(started);
        trace.record(Layer::Cached, stats);
        hit
    }

    async fn check_cached(
        &self,
        key: &ResolutionKey,
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
        stats: &mut LayerStats,
    ) -> Option<Accepted> {
        let entry = match self.store.lookup(key).await {
            Lookup::Hit(entry) => entry,
            Lookup::Expired => {
                stats.invalid += 1;
                trace.fail(Layer::Cached, FailureKind::Expired, key.storage_key(), None);
                self.metrics.emit(&MetricEvent::CacheInvalidated {
                    key: key.clone(),
                    reason: FailureKind::Expired,
                });
                return None;
            }
            Lookup::Miss => {
                stats.not_found += 1;
                return None;
            }
        };
        stats.tried += 1;

        let locator = &entry.record.locator;
        let (reason, detail) = match self.driver.locate(locator, opts.scope.as_ref()).await {
            Ok(Some(live)) => {
                stats.match_count += 1;
                if !fingerprint::matches(&entry.record.fingerprint, &live) {
                    stats.invalid += 1;
                    (FailureKind::FingerprintMismatch, None)
                } else if !self.driver.validate(key, &live).await {
                    stats.rejected += 1;
                    (FailureKind::NotInteractable, None)
                } else {
                    debug!("Cache hit for {}: {}", key, locator);
                    return Some((Layer::Cached, entry.record, live));
                }
            }
            Ok(None) => {
                stats.not_found += 1;
                (FailureKind::NotFound, None)
            }
            Err(Error::InvalidLocatorSyntax(msg)) => {
                stats.invalid += 1;
                (FailureKind::InvalidLocatorSyntax, Some(msg))
            }
            Err(e) => {
                stats.not_found += 1;
                (FailureKind::NotFound, Some(e.to_string()))
            }
        };

        debug!("Cached locator for {} unusable ({}), invalidating", key, reason.as_str());
        trace.fail(Layer::Cached, reason, locator.as_str(), detail);
        if self.store.invalidate(key, entry.record.discovered_at).await {
            self.metrics.emit(&MetricEvent::CacheInvalidated {
                key: key.clone(),
                reason,
            });
        }
        None
    }

    /// Versioned and Emergency layers: try each locator in order.
    async fn try_static(
        &self,
        layer: Layer,
        key: &ResolutionKey,
        locators: &[Locator],
        confidence: u8,
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
    ) -> Result<Option<Accepted>> {
        let started = Instant::now();
        let mut stats = LayerStats::default();
        let mut found = None;

        for locator in locators {
            if self.cancel.is_cancelled() {
                stats.duration_ms = elapsed_ms(started);
                trace.record(layer, stats);
                return Err(Error::Cancelled);
            }
            stats.tried += 1;
            match self.driver.locate(locator, opts.scope.as_ref()).await {
                Ok(Some(live)) => {
                    stats.match_count += 1;
                    if self.driver.validate(key, &live).await {
                        found = Some(live);
                        break;
                    }
                    stats.rejected += 1;
                    trace.fail(layer, FailureKind::NotInteractable, locator.as_str(), None);
                }
                Ok(None) => {
                    stats.not_found += 1;
                    trace.fail(layer, FailureKind::NotFound, locator.as_str(), None);
                }
                Err(Error::InvalidLocatorSyntax(msg)) => {
                    stats.invalid += 1;
                    trace.fail(layer, FailureKind::InvalidLocatorSyntax, locator.as_str(), Some(msg));
                }
                Err(e) => {
                    stats.not_found += 1;
                    trace.fail(layer, FailureKind::NotFound, locator.as_str(), Some(e.to_string()));
                }
            }
        }

        let accepted = match found {
            Some(live) => {
                stats.success += 1;
                Some(self.accept(key, layer, confidence, live).await)
            }
            None => {
                debug!("{} layer found nothing for {} ({} locators)", layer, key, locators.len());
                None
            }
        };
        stats.duration_ms = elapsed_ms(started);
        trace.record(layer, stats);
        Ok(accepted)
    }

    fn strategies_for(&self, key: &ResolutionKey) -> &[Arc<dyn Heuristic>] {
        self.heuristics
            .get(&key.storage_key())
            .or_else(|| self.heuristics.get(&key.target_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn anchors_for(&self, key: &ResolutionKey, opts: &ResolveOptions) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for term in self.catalog.anchors(key).into_iter().chain(opts.anchors.iter().cloned()) {
            if !out.iter().any(|t| t.eq_ignore_ascii_case(&term)) {
                out.push(term);
            }
        }
        out
    }

    /// Heuristic layer: repeated discovery passes with exponential backoff
    /// until a candidate clears the confidence floor or the budget runs out.
    async fn try_heuristic(
        &self,
        key: &ResolutionKey,
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
    ) -> Result<Option<Accepted>> {
        let started = Instant::now();
        let strategies = self.strategies_for(key);
        let anchors = self.anchors_for(key, opts);
        let budget = opts.timeout.unwrap_or_else(|| self.config.discovery_timeout());
        let deadline = started + budget;
        let mut stats = LayerStats::default();
        let mut attempt = 0u32;

        let outcome = loop {
            if let Err(e) = self.check_cancelled() {
                break Err(e);
            }
            trace.heuristic_passes += 1;
            if let Some(found) = self
                .heuristic_pass(key, strategies, &anchors, opts, trace, &mut stats)
                .await
            {
                break Ok(Some(found));
            }
            if strategies.is_empty() {
                break Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(None);
            }
            let delay = backoff_delay(attempt, self.config.backoff_base_ms, self.config.backoff_cap_ms)
                .min(deadline - now);
            attempt += 1;
            debug!(
                "No heuristic candidate for {} (pass {}), retrying in {}ms",
                key,
                attempt,
                delay.as_millis()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let accepted = match outcome {
            Ok(Some((live, score))) => {
                stats.success += 1;
                Ok(Some(self.accept(key, Layer::Heuristic, score, live).await))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        stats.duration_ms = elapsed_ms(started);
        trace.record(Layer::Heuristic, stats);
        accepted
    }

    async fn heuristic_pass(
        &self,
        key: &ResolutionKey,
        strategies: &[Arc<dyn Heuristic>],
        anchors: &[String],
        opts: &ResolveOptions,
        trace: &mut ResolutionTrace,
        stats: &mut LayerStats,
    ) -> Option<(LiveCandidate, u8)> {
        for strategy in strategies {
            stats.tried += 1;
            let found = match strategy.try_locate(key, opts.hint.as_deref()).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    stats.not_found += 1;
                    trace.fail(Layer::Heuristic, FailureKind::NotFound, strategy.name(), None);
                    continue;
                }
                Err(Error::InvalidLocatorSyntax(msg)) => {
                    stats.invalid += 1;
                    trace.fail(
                        Layer::Heuristic,
                        FailureKind::InvalidLocatorSyntax,
                        strategy.name(),
                        Some(msg),
                    );
                    continue;
                }
                Err(e) => {
                    stats.not_found += 1;
                    trace.fail(
                        Layer::Heuristic,
                        FailureKind::NotFound,
                        strategy.name(),
                        Some(e.to_string()),
                    );
                    continue;
                }
            };
            stats.match_count += 1;

            let score = self.scorer.score(&found, anchors);
            if !self.scorer.accepts(score) {
                stats.rejected += 1;
                trace.fail(
                    Layer::Heuristic,
                    FailureKind::ConfidenceTooLow,
                    strategy.name(),
                    Some(format!("{} < {}", score, self.scorer.min_confidence)),
                );
                continue;
            }
            if !self.driver.validate(key, &found.candidate).await {
                stats.rejected += 1;
                trace.fail(Layer::Heuristic, FailureKind::NotInteractable, strategy.name(), None);
                continue;
            }
            debug!("Heuristic '{}' matched {} (confidence {})", strategy.name(), key, score);
            return Some((found.candidate, score));
        }
        None
    }

    /// Capture cache metadata for an accepted candidate and persist it.
    async fn accept(&self, key: &ResolutionKey, layer: Layer, confidence: u8, live: LiveCandidate) -> Accepted {
        let record = CandidateRecord {
            locator: self.driver.describe_locator(&live),
            layer,
            fingerprint: self.driver.describe_fingerprint(&live),
            confidence,
            discovered_at: self.store.clock().now_ms(),
        };
        self.store.set(key, record.clone(), self.store.default_ttl()).await;
        (layer, record, live)
    }
}

/// `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(20);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let delays: Vec<u64> = (0..7)
            .map(|a| backoff_delay(a, 200, 5_000).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1_600, 3_200, 5_000, 5_000]);
        assert_eq!(backoff_delay(63, 200, 5_000), Duration::from_millis(5_000));
    }

    #[test]
    fn options_builder() {
        let opts = ResolveOptions::default()
            .force_discovery()
            .with_hint("composer")
            .with_anchors(["send", "message"])
            .with_timeout(Duration::from_secs(2))
            .within("main");
        assert!(opts.force_discovery);
        assert_eq!(opts.hint.as_deref(), Some("composer"));
        assert_eq!(opts.anchors.len(), 2);
        assert_eq!(opts.timeout, Some(Duration::from_secs(2)));
        assert_eq!(opts.scope.as_ref().map(Locator::as_str), Some("main"));
    }
}
