//! Durable key/value backends for the candidate cache.

use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Backing store. Failures are treated as misses by [`CandidateStore`](super::CandidateStore).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// All stored keys, for hydration. Backends that cannot enumerate return none.
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

/// JSON file store. The whole map is rewritten on every mutation.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    lock: tokio::sync::Mutex<Option<BTreeMap<String, String>>>,
}

impl FileKv {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let body = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} cache entries to {}", map.len(), self.path.display());
        Ok(())
    }

    async fn with_map<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool)) -> Result<T> {
        let mut guard = self.lock.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let Some(map) = guard.as_mut() else {
            return Err(crate::Error::Driver("file store not loaded".into()));
        };
        let (out, dirty) = f(map);
        if dirty {
            self.write_file(map).await?;
        }
        Ok(out)
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_map(|m| (m.get(key).cloned(), false)).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.with_map(|m| ((), m.insert(key.to_string(), value.clone()).as_ref() != Some(&value)))
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.with_map(|m| ((), m.remove(key).is_some())).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.with_map(|m| (m.keys().cloned().collect(), false)).await
    }
}
