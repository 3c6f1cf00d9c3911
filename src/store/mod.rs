//! Namespaced, TTL-bound candidate cache.
//!
//! An in-memory index sits in front of a [`KvStore`]. The index is the
//! authority within a process; the backend only makes entries outlive it.
//! Backend failures are logged and treated as misses; no method here returns an
//! error.

mod kv;

pub use kv::{FileKv, KvStore, MemoryKv};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::model::{CacheEntry, CandidateRecord, ResolutionKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheEntry),
    /// An entry existed but had expired; it has been removed.
    Expired,
    Miss,
}

pub struct CandidateStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    index: Mutex<HashMap<ResolutionKey, CacheEntry>>,
    last_sweep: AtomicI64,
}

impl CandidateStore {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_clock(kv, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KvStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            kv,
            clock,
            config,
            index: Mutex::new(HashMap::new()),
            last_sweep: AtomicI64::new(now),
        }
    }

    /// TTL applied by the resolver to fresh entries.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn index(&self) -> MutexGuard<'_, HashMap<ResolutionKey, CacheEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index a loaded entry unless a fresher write got there first.
    fn remember(&self, key: &ResolutionKey, entry: CacheEntry) -> CacheEntry {
        self.index().entry(key.clone()).or_insert(entry).clone()
    }

    /// Live entry for `key`. Expired entries are removed as a side effect.
    pub async fn get(&self, key: &ResolutionKey) -> Option<CacheEntry> {
        match self.lookup(key).await {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Expired | Lookup::Miss => None,
        }
    }

    /// Like [`get`](Self::get), but distinguishes an expired entry from a miss.
    pub async fn lookup(&self, key: &ResolutionKey) -> Lookup {
        let now = self.clock.now_ms();
        let cached = self.index().get(key).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let Some(loaded) = self.load(key).await else {
                    return Lookup::Miss;
                };
                self.remember(key, loaded)
            }
        };

        if entry.is_expired(now) {
            debug!("Cache entry for {} expired", key);
            self.invalidate(key, entry.record.discovered_at).await;
            return Lookup::Expired;
        }
        Lookup::Hit(entry)
    }

    /// Write a fresh entry, replacing any previous one for `key`.
    pub async fn set(&self, key: &ResolutionKey, record: CandidateRecord, ttl: Duration) {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            expires_at: now.saturating_add(ttl.as_millis() as i64),
            record,
        };

        let evicted = {
            let mut index = self.index();
            index.insert(key.clone(), entry.clone());
            evict_oldest(&mut index, self.config.max_entries)
        };

        match serde_json::to_string(&entry) {
            Ok(body) => {
                if let Err(e) = self.kv.set(&key.storage_key(), body).await {
                    warn!("Failed to persist cache entry for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode cache entry for {}: {}", key, e),
        }
        for k in evicted {
            debug!("Evicted cache entry for {} (capacity {})", k, self.config.max_entries);
            self.remove_persisted(&k).await;
        }

        self.sweep_expired().await;
    }

    /// Unconditionally drop the entry for `key`.
    pub async fn remove(&self, key: &ResolutionKey) {
        self.index().remove(key);
        self.remove_persisted(key).await;
    }

    /// Drop the entry for `key` only if it is still the record discovered at
    /// `discovered_at`. Returns whether an entry was removed.
    pub async fn invalidate(&self, key: &ResolutionKey, discovered_at: i64) -> bool {
        let removed = {
            let mut index = self.index();
            match index.get(key) {
                Some(current) if current.record.discovered_at != discovered_at => false,
                Some(_) => index.remove(key).is_some(),
                None => true,
            }
        };
        if removed {
            self.remove_persisted(key).await;
        }
        removed
    }

    /// Sweep expired entries, at most once per `sweep_interval_ms`.
    /// Returns the number removed (0 when skipped).
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let last = self.last_sweep.load(Ordering::SeqCst);
        if now.saturating_sub(last) < self.config.sweep_interval_ms as i64 {
            return 0;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }
        self.sweep_at(now).await
    }

    /// Sweep now, ignoring the rate limit.
    pub async fn force_sweep(&self) -> usize {
        let now = self.clock.now_ms();
        self.last_sweep.store(now, Ordering::SeqCst);
        self.sweep_at(now).await
    }

    async fn sweep_at(&self, now: i64) -> usize {
        let removed: Vec<ResolutionKey> = {
            let mut index = self.index();
            let expired: Vec<ResolutionKey> = index
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                index.remove(k);
            }
            let mut removed = expired;
            removed.extend(evict_oldest(&mut index, self.config.max_entries));
            removed
        };
        for k in &removed {
            self.remove_persisted(k).await;
        }
        if !removed.is_empty() {
            debug!("Swept {} cache entries", removed.len());
        }
        removed.len()
    }

    /// Load every persisted entry into the index so sweeps and eviction cover
    /// entries written by earlier processes. Returns the number loaded.
    pub async fn hydrate(&self) -> usize {
        let keys = match self.kv.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to enumerate persisted cache: {}", e);
                return 0;
            }
        };
        let mut loaded = 0;
        for raw in keys {
            let Some(key) = ResolutionKey::from_storage_key(&raw) else {
                continue;
            };
            if let Some(entry) = self.load(&key).await {
                self.remember(&key, entry);
                loaded += 1;
            }
        }
        let evicted = evict_oldest(&mut self.index(), self.config.max_entries);
        for k in &evicted {
            self.remove_persisted(k).await;
        }
        loaded
    }

    /// Drop all entries, or only those in `namespace`. Returns the number removed.
    pub async fn clear(&self, namespace: Option<&str>) -> usize {
        let removed: Vec<ResolutionKey> = {
            let mut index = self.index();
            let keys: Vec<ResolutionKey> = index
                .keys()
                .filter(|k| namespace.map_or(true, |ns| k.namespace == ns))
                .cloned()
                .collect();
            for k in &keys {
                index.remove(k);
            }
            keys
        };
        for k in &removed {
            self.remove_persisted(k).await;
        }
        removed.len()
    }

    /// Snapshot of indexed entries, ordered by key.
    pub fn entries(&self) -> Vec<(ResolutionKey, CacheEntry)> {
        let mut out: Vec<_> = self.index().iter().map(|(k, e)| (k.clone(), e.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn load(&self, key: &ResolutionKey) -> Option<CacheEntry> {
        let raw = match self.kv.get(&key.storage_key()).await {
            Ok(raw) => raw?,
            Err(e) => {
                debug!("Cache read for {} failed, treating as miss: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Discarding undecodable cache entry for {}: {}", key, e);
                self.remove_persisted(key).await;
                None
            }
        }
    }

    async fn remove_persisted(&self, key: &ResolutionKey) {
        if let Err(e) = self.kv.remove(&key.storage_key()).await {
            warn!("Failed to remove persisted cache entry for {}: {}", key, e);
        }
    }
}

/// Remove the oldest-discovered entries until at most `max` remain.
fn evict_oldest(index: &mut HashMap<ResolutionKey, CacheEntry>, max: usize) -> Vec<ResolutionKey> {
    if index.len() <= max {
        return Vec::new();
    }
    let mut by_age: Vec<(i64, ResolutionKey)> = index
        .iter()
        .map(|(k, e)| (e.record.discovered_at, k.clone()))
        .collect();
    by_age.sort();
    let excess = index.len() - max;
    by_age
        .into_iter()
        .take(excess)
        .map(|(_, k)| {
            index.remove(&k);
            k
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Fingerprint, Layer};
    use crate::{Error, Result};
    use async_trait::async_trait;

    fn record(locator: &str, discovered_at: i64) -> CandidateRecord {
        CandidateRecord {
            locator: locator.into(),
            layer: Layer::Heuristic,
            fingerprint: Fingerprint::default(),
            confidence: 90,
            discovered_at,
        }
    }

    fn store_with(kv: Arc<dyn KvStore>, clock: Arc<ManualClock>, config: CacheConfig) -> CandidateStore {
        CandidateStore::with_clock(kv, config, clock)
    }

    #[tokio::test]
    async fn ttl_boundary() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store_with(Arc::new(MemoryKv::new()), clock.clone(), CacheConfig::default());
        let key = ResolutionKey::new("chatgpt", "composer");

        store.set(&key, record("#a", 10_000), Duration::from_millis(500)).await;
        clock.set(10_499);
        assert!(store.get(&key).await.is_some());
        clock.set(10_501);
        assert_eq!(store.lookup(&key).await, Lookup::Expired);
        assert_eq!(store.lookup(&key).await, Lookup::Miss);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reads_through_to_backend() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(MemoryKv::new());
        let key = ResolutionKey::new("claude", "send");

        let first = store_with(kv.clone(), clock.clone(), CacheConfig::default());
        first.set(&key, record("button", 0), Duration::from_secs(60)).await;

        let second = store_with(kv, clock, CacheConfig::default());
        let entry = second.get(&key).await.unwrap();
        assert_eq!(entry.record.locator.as_str(), "button");
        assert_eq!(entry.expires_at, 60_000);
    }

    #[tokio::test]
    async fn invalidate_is_compare_and_remove() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(Arc::new(MemoryKv::new()), clock, CacheConfig::default());
        let key = ResolutionKey::new("gemini", "composer");

        store.set(&key, record("old", 1), Duration::from_secs(60)).await;
        store.set(&key, record("new", 2), Duration::from_secs(60)).await;

        assert!(!store.invalidate(&key, 1).await);
        assert_eq!(store.get(&key).await.unwrap().record.locator.as_str(), "new");
        assert!(store.invalidate(&key, 2).await);
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(MemoryKv::new());
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let store = store_with(kv.clone(), clock, config);

        for (i, target) in ["a", "b", "c"].iter().enumerate() {
            let key = ResolutionKey::new("ns", *target);
            store.set(&key, record(target, i as i64), Duration::from_secs(60)).await;
        }

        assert_eq!(store.len(), 2);
        assert!(store.get(&ResolutionKey::new("ns", "a")).await.is_none());
        assert!(store.get(&ResolutionKey::new("ns", "c")).await.is_some());
        assert_eq!(kv.len(), 2);
    }

    #[tokio::test]
    async fn sweep_is_rate_limited() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            sweep_interval_ms: 1_000,
            ..Default::default()
        };
        let store = store_with(Arc::new(MemoryKv::new()), clock.clone(), config);
        store.set(&ResolutionKey::new("ns", "a"), record("a", 0), Duration::from_millis(10)).await;
        store.set(&ResolutionKey::new("ns", "b"), record("b", 0), Duration::from_millis(10)).await;

        clock.set(500);
        assert_eq!(store.sweep_expired().await, 0);
        assert_eq!(store.len(), 2);

        clock.set(1_000);
        assert_eq!(store.sweep_expired().await, 2);
        assert_eq!(store.sweep_expired().await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn hydrate_loads_persisted_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(MemoryKv::new());
        let writer = store_with(kv.clone(), clock.clone(), CacheConfig::default());
        writer.set(&ResolutionKey::new("a", "x"), record("x", 0), Duration::from_secs(1)).await;
        writer.set(&ResolutionKey::new("b", "y"), record("y", 0), Duration::from_secs(1)).await;
        kv.set("garbage-key", "{}".into()).await.unwrap();

        let reader = store_with(kv, clock.clone(), CacheConfig::default());
        assert_eq!(reader.hydrate().await, 2);
        assert_eq!(reader.len(), 2);

        clock.set(5_000);
        assert_eq!(reader.force_sweep().await, 2);
    }

    #[tokio::test]
    async fn clear_by_namespace() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(Arc::new(MemoryKv::new()), clock, CacheConfig::default());
        store.set(&ResolutionKey::new("a", "x"), record("x", 0), Duration::from_secs(1)).await;
        store.set(&ResolutionKey::new("a", "y"), record("y", 0), Duration::from_secs(1)).await;
        store.set(&ResolutionKey::new("b", "x"), record("x", 0), Duration::from_secs(1)).await;

        assert_eq!(store.clear(Some("a")).await, 2);
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.clear(None).await, 1);
    }

    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Driver("disk on fire".into()))
        }
        async fn set(&self, _key: &str, _value: String) -> Result<()> {
            Err(Error::Driver("disk on fire".into()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::Driver("disk on fire".into()))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(Error::Driver("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn backend_failures_are_misses() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(Arc::new(BrokenKv), clock, CacheConfig::default());
        let key = ResolutionKey::new("ns", "t");

        assert!(store.get(&key).await.is_none());
        store.set(&key, record("t", 0), Duration::from_secs(1)).await;
        // Still served from the index after a failed write.
        assert!(store.get(&key).await.is_some());
        store.remove(&key).await;
        assert_eq!(store.hydrate().await, 0);
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(MemoryKv::new());
        kv.set("ns::t", "{not json".into()).await.unwrap();
        let store = store_with(kv.clone(), clock, CacheConfig::default());
        assert!(store.get(&ResolutionKey::new("ns", "t")).await.is_none());
        assert!(kv.is_empty());
    }
}
