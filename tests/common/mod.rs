//! Scripted fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use eoka_resolver::{
    CandidateStore, ChangeEvent, ChangeFeed, Config, Driver, Error, Heuristic, HeuristicMatch, LiveCandidate,
    Locator, ManualClock, MemoryKv, MetricEvent, MetricsSink, NodeFeatures, ResolutionKey, Result, Subscription,
    TextSource,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const CONFIG: &str = r##"
resolver:
  backoff_base_ms: 100
  backoff_cap_ms: 400
  discovery_timeout_ms: 1000
  request_deadline_ms: 5000
cache:
  ttl_ms: 60000
providers:
  chatgpt:
    default_version: v2
    versions:
      v2:
        composer: ["#prompt-textarea", "div.composer [contenteditable]"]
    emergency:
      composer: ["textarea"]
      response: ["div.markdown"]
    anchors:
      composer: ["message"]
"##;

pub fn config() -> Config {
    Config::parse(CONFIG).unwrap()
}

pub fn key(target: &str) -> ResolutionKey {
    ResolutionKey::new("chatgpt", target)
}

/// A candidate whose fingerprint is `tag` under `form > main`.
pub fn node(locator: &str, tag: &str) -> LiveCandidate {
    LiveCandidate::new(locator).with_ancestry(vec![
        NodeFeatures::tag(tag),
        NodeFeatures::tag("form"),
        NodeFeatures::tag("main"),
    ])
}

pub fn store(clock: Arc<ManualClock>) -> CandidateStore {
    CandidateStore::with_clock(Arc::new(MemoryKv::new()), config().cache, clock)
}

/// In-memory page: locators map to candidates.
#[derive(Default)]
pub struct FakeDriver {
    nodes: Mutex<HashMap<String, LiveCandidate>>,
    hidden: Mutex<HashSet<String>>,
    malformed: Mutex<HashSet<String>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, candidate: LiveCandidate) {
        self.nodes
            .lock()
            .unwrap()
            .insert(candidate.locator.as_str().to_string(), candidate);
    }

    pub fn remove(&self, locator: &str) {
        self.nodes.lock().unwrap().remove(locator);
    }

    pub fn hide(&self, locator: &str) {
        self.hidden.lock().unwrap().insert(locator.to_string());
    }

    pub fn malformed(&self, locator: &str) {
        self.malformed.lock().unwrap().insert(locator.to_string());
    }

    /// Every locator passed to `locate`, in call order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn locate(&self, locator: &Locator, _scope: Option<&Locator>) -> Result<Option<LiveCandidate>> {
        self.lookups.lock().unwrap().push(locator.as_str().to_string());
        if self.malformed.lock().unwrap().contains(locator.as_str()) {
            return Err(Error::InvalidLocatorSyntax(locator.to_string()));
        }
        Ok(self.nodes.lock().unwrap().get(locator.as_str()).cloned())
    }

    async fn validate(&self, _key: &ResolutionKey, candidate: &LiveCandidate) -> bool {
        !self.hidden.lock().unwrap().contains(candidate.locator.as_str())
    }

    async fn snapshot(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "nodes": self.nodes.lock().unwrap().len() }))
    }
}

/// Heuristic that replays a script, one entry per pass; the last entry repeats.
pub struct ScriptedHeuristic {
    name: String,
    script: Mutex<VecDeque<Option<HeuristicMatch>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedHeuristic {
    pub fn new(name: &str, script: Vec<Option<HeuristicMatch>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn never(name: &str) -> Arc<Self> {
        Self::new(name, vec![None])
    }

    pub fn always(name: &str, found: HeuristicMatch) -> Arc<Self> {
        Self::new(name, vec![Some(found)])
    }

    /// Same as [`always`](Self::always), but each pass takes `delay`.
    pub fn slow(name: &str, found: HeuristicMatch, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::from(vec![Some(found)])),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Heuristic for ScriptedHeuristic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_locate(&self, _key: &ResolutionKey, _hint: Option<&str>) -> Result<Option<HeuristicMatch>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().flatten()
            } else {
                script.front().cloned().flatten()
            }
        };
        Ok(next)
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(MetricEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn emit(&self, event: &MetricEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Text source that replays a script; the last entry repeats.
pub struct ScriptedText {
    script: Mutex<VecDeque<Option<String>>>,
    reads: AtomicUsize,
}

impl ScriptedText {
    pub fn new(script: &[Option<&str>]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().map(|s| s.map(str::to_string)).collect()),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn of(script: &[&str]) -> Arc<Self> {
        let owned: Vec<Option<&str>> = script.iter().map(|s| Some(*s)).collect();
        Self::new(&owned)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextSource for ScriptedText {
    async fn extract(&self, _scope: &Locator) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front().flatten()
        } else {
            script.front().cloned().flatten()
        };
        Ok(next)
    }
}

/// Change feed driven by the test through [`notify`](Self::notify).
#[derive(Default)]
pub struct ManualFeed {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>>,
    active: Arc<AtomicUsize>,
}

impl ManualFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        for tx in self.senders.lock().unwrap().iter() {
            let _ = tx.send(ChangeEvent);
        }
    }

    /// Subscriptions not yet dropped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl ChangeFeed for ManualFeed {
    fn subscribe(&self, _scope: &Locator) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        Subscription::new(rx, move || {
            active.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
