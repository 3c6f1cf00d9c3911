//! Settle detection for continuously changing targets (streaming responses).
//!
//! A watcher samples the target's text immediately, then again after each
//! debounced change notification and on a fixed periodic tick. It reports
//! [`StabilizeStatus::Stable`] once the trailing `stable_samples` content hashes
//! agree and every end-marker holds, or [`StabilizeStatus::Timeout`] with the
//! last captured content at the deadline.

pub mod markers;

use crate::config::{StabilizeConfig, MIN_STABLE_SAMPLES};
use crate::driver::{ChangeFeed, Driver, DriverText, EndMarker, TextSource};
use crate::metrics::{MetricEvent, MetricsSink, TracingMetrics};
use crate::model::{Locator, ResolutionKey};
use crate::resolver::LocatorCatalog;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Terminal state of a stabilization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizeStatus {
    Stable,
    /// Deadline reached; the value is best-effort.
    Timeout,
}

impl StabilizeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StabilizeStatus::Stable => "stable",
            StabilizeStatus::Timeout => "timeout",
        }
    }
}

/// Which extraction source produced the returned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOrigin {
    Primary,
    Fallback,
}

/// Result of a stabilization session.
#[derive(Debug, Clone, PartialEq)]
pub struct Stabilized {
    pub status: StabilizeStatus,
    pub text: String,
    pub origin: TextOrigin,
    pub samples: u32,
    pub elapsed: Duration,
}

/// State for one wait. Dropped on every exit path.
struct Session {
    history: VecDeque<u64>,
    capacity: usize,
    last: Option<Captured>,
    started: Instant,
    primary_seen_at: Instant,
    samples: u32,
}

struct Captured {
    text: String,
    hash: u64,
    origin: TextOrigin,
}

impl Session {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            last: None,
            started: now,
            primary_seen_at: now,
            samples: 0,
        }
    }

    fn push(&mut self, text: Option<(String, TextOrigin)>) {
        let hash = content_hash(text.as_ref().map(|(t, _)| t.as_str()).unwrap_or(""));
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(hash);
        self.samples += 1;
        if let Some((text, origin)) = text {
            self.last = Some(Captured { text, hash, origin });
        }
    }

    /// Trailing `n` hashes agree and equal the last captured content.
    fn settled(&self, n: usize) -> bool {
        let Some(ref last) = self.last else {
            return false;
        };
        self.history.len() >= n && self.history.iter().rev().take(n).all(|h| *h == last.hash)
    }
}

fn content_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Observes a resolved streaming target until it settles or times out.
pub struct StabilizationWatcher {
    config: StabilizeConfig,
    primary: Arc<dyn TextSource>,
    fallback: Option<Arc<dyn TextSource>>,
    feed: Option<Arc<dyn ChangeFeed>>,
    markers: Vec<Arc<dyn EndMarker>>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl StabilizationWatcher {
    pub fn new(primary: Arc<dyn TextSource>, config: StabilizeConfig) -> Self {
        Self {
            config,
            primary,
            fallback: None,
            feed: None,
            markers: Vec::new(),
            metrics: Arc::new(TracingMetrics),
            cancel: CancellationToken::new(),
        }
    }

    /// Watcher reading `locator`'s text through `driver`, with the end-markers
    /// the catalog configures for `key`.
    pub fn for_target(
        driver: Arc<dyn Driver>,
        catalog: &LocatorCatalog,
        key: &ResolutionKey,
        locator: Locator,
        config: StabilizeConfig,
    ) -> Self {
        let specs = catalog.end_markers(key);
        let markers = markers::build_all(&specs, &driver);
        Self::new(Arc::new(DriverText::new(driver, locator)), config).with_markers(markers)
    }

    /// Lower-priority source read once the primary has been empty for
    /// `fallback_after_ms`.
    pub fn with_fallback(mut self, fallback: Arc<dyn TextSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_marker(mut self, marker: Arc<dyn EndMarker>) -> Self {
        self.markers.push(marker);
        self
    }

    pub fn with_markers(mut self, markers: Vec<Arc<dyn EndMarker>>) -> Self {
        self.markers.extend(markers);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait until the target in `scope` stops changing.
    ///
    /// Returns `Stable` or best-effort `Timeout`. Fails with
    /// [`Error::NotFound`] only if no content was ever observed, and with
    /// [`Error::Cancelled`] on external abort.
    pub async fn wait_for_stable(&self, key: &ResolutionKey, scope: &Locator) -> Result<Stabilized> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut session = Session::new(self.config.history_len.max(self.required()), started);

        let outcome = self.observe(&mut session, scope, deadline).await;
        let elapsed = started.elapsed();

        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                debug!("Stabilization for {} aborted: {}", key, e);
                return Err(e);
            }
        };
        self.metrics.emit(&MetricEvent::Stabilized {
            key: key.clone(),
            status,
            samples: session.samples,
            elapsed_ms: elapsed.as_millis() as u64,
        });

        match session.last {
            Some(last) => {
                info!(
                    "{} {} after {}ms ({} samples, {} chars)",
                    key,
                    status.as_str(),
                    elapsed.as_millis(),
                    session.samples,
                    last.text.len()
                );
                Ok(Stabilized {
                    status,
                    text: last.text,
                    origin: last.origin,
                    samples: session.samples,
                    elapsed,
                })
            }
            None => Err(Error::NotFound(format!(
                "no content observed for {} within {}ms",
                key,
                elapsed.as_millis()
            ))),
        }
    }

    async fn observe(&self, session: &mut Session, scope: &Locator, deadline: Instant) -> Result<StabilizeStatus> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Initial sample, no wait.
        if let Some(status) = self.step(session, scope, deadline).await? {
            return Ok(status);
        }

        let mut subscription = self.feed.as_ref().map(|f| f.subscribe(scope));
        let mut feed_open = subscription.is_some();
        let interval = self.config.sample_interval();
        let mut ticker = tokio::time::interval_at(session.started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut debounce_at: Option<Instant> = None;

        loop {
            let debounce_deadline = debounce_at.unwrap_or(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Stabilization deadline reached after {} samples", session.samples);
                    return Ok(StabilizeStatus::Timeout);
                }
                event = next_event(&mut subscription), if feed_open => {
                    match event {
                        Some(_) => debounce_at = Some(Instant::now() + self.config.debounce()),
                        None => feed_open = false,
                    }
                }
                _ = tokio::time::sleep_until(debounce_deadline), if debounce_at.is_some() => {
                    debounce_at = None;
                    if let Some(status) = self.step(session, scope, deadline).await? {
                        return Ok(status);
                    }
                }
                _ = ticker.tick() => {
                    if let Some(status) = self.step(session, scope, deadline).await? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// Take one sample and check stability, abandoning both on cancellation
    /// or at the deadline.
    async fn step(&self, session: &mut Session, scope: &Locator, deadline: Instant) -> Result<Option<StabilizeStatus>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Stabilization deadline reached while sampling {}", scope);
                Ok(Some(StabilizeStatus::Timeout))
            }
            stable = async {
                self.sample(session, scope).await;
                self.is_stable(session).await
            } => Ok(stable.then_some(StabilizeStatus::Stable)),
        }
    }

    fn required(&self) -> usize {
        self.config.stable_samples.max(MIN_STABLE_SAMPLES)
    }

    async fn sample(&self, session: &mut Session, scope: &Locator) {
        let now = Instant::now();
        let mut text = read(self.primary.as_ref(), scope).await.map(|t| (t, TextOrigin::Primary));
        if text.is_some() {
            session.primary_seen_at = now;
        } else if let (Some(fallback), Some(after)) = (&self.fallback, self.config.fallback_after()) {
            if now.duration_since(session.primary_seen_at) >= after {
                text = read(fallback.as_ref(), scope).await.map(|t| (t, TextOrigin::Fallback));
            }
        }
        session.push(text);
    }

    async fn is_stable(&self, session: &Session) -> bool {
        if !session.settled(self.required()) {
            return false;
        }
        for marker in &self.markers {
            if !marker.satisfied().await {
                debug!("Content settled but end-marker {} not yet satisfied", marker.describe());
                return false;
            }
        }
        true
    }
}

async fn read(source: &dyn TextSource, scope: &Locator) -> Option<String> {
    match source.extract(scope).await {
        Ok(text) => text.filter(|t| !t.trim().is_empty()),
        Err(e) => {
            debug!("Text extraction failed: {}", e);
            None
        }
    }
}

async fn next_event(subscription: &mut Option<crate::driver::Subscription>) -> Option<crate::driver::ChangeEvent> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}
