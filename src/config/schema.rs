use super::EndMarkerSpec;
use crate::model::Locator;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Layered resolution tuning.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Candidate cache policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Streaming-target stabilization tuning.
    #[serde(default)]
    pub stabilize: StabilizeConfig,

    /// Locator catalogs, keyed by namespace.
    #[serde(default)]
    pub providers: HashMap<String, ProviderCatalog>,
}

impl Config {
    /// Load config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config.
    pub fn validate(&self) -> Result<()> {
        self.resolver.validate()?;
        self.cache.validate()?;
        self.stabilize.validate()?;
        for (name, provider) in &self.providers {
            provider
                .validate()
                .map_err(|e| Error::Config(format!("providers.{}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Layered resolver tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Heuristic acceptance floor (0-100).
    pub min_confidence: u8,
    /// Confidence for heuristics that return an unscored candidate.
    pub default_confidence: u8,
    /// Bonus per distinct anchor term matched.
    pub anchor_boost: u8,
    /// Ceiling on the total anchor bonus.
    pub max_anchor_boost: u8,
    /// Confidence recorded for versioned-catalog hits.
    pub versioned_confidence: u8,
    /// Confidence recorded for emergency-list hits.
    pub emergency_confidence: u8,
    /// First heuristic retry delay.
    pub backoff_base_ms: u64,
    /// Maximum heuristic retry delay.
    pub backoff_cap_ms: u64,
    /// Budget for the heuristic discovery loop.
    pub discovery_timeout_ms: u64,
    /// Overall deadline enforced by the request coordinator.
    pub request_deadline_ms: u64,
    /// Upper bound on collecting a failure snapshot.
    pub snapshot_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: crate::scorer::MIN_CONFIDENCE,
            default_confidence: crate::scorer::DEFAULT_CONFIDENCE,
            anchor_boost: crate::scorer::ANCHOR_BOOST,
            max_anchor_boost: crate::scorer::MAX_ANCHOR_BOOST,
            versioned_confidence: 100,
            emergency_confidence: 60,
            backoff_base_ms: 200,
            backoff_cap_ms: 5_000,
            discovery_timeout_ms: 10_000,
            request_deadline_ms: 15_000,
            snapshot_timeout_ms: 250,
        }
    }
}

impl ResolverConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("min_confidence", self.min_confidence),
            ("default_confidence", self.default_confidence),
            ("versioned_confidence", self.versioned_confidence),
            ("emergency_confidence", self.emergency_confidence),
        ] {
            if v > 100 {
                return Err(Error::Config(format!("resolver.{} must be at most 100", name)));
            }
        }
        if self.min_confidence == 0 {
            return Err(Error::Config("resolver.min_confidence must be at least 1".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::Config("resolver.backoff_base_ms must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(Error::Config(
                "resolver.backoff_base_ms must not exceed backoff_cap_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Candidate cache policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a written entry.
    pub ttl_ms: u64,
    /// Entry count above which the oldest records are evicted.
    pub max_entries: usize,
    /// Minimum spacing between expiry sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 24 * 60 * 60 * 1000,
            max_entries: 256,
            sweep_interval_ms: 15 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(Error::Config("cache.ttl_ms must be at least 1".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Fewest identical trailing hashes that count as settled.
pub const MIN_STABLE_SAMPLES: usize = 3;

/// Upper bound on retained hash samples.
pub const MAX_HISTORY_LEN: usize = 4;

/// Stabilization tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilizeConfig {
    /// Quiet period after a change notification before re-sampling.
    pub debounce_ms: u64,
    /// Periodic sampling interval, independent of notifications.
    pub sample_interval_ms: u64,
    /// Identical trailing samples required for stability.
    pub stable_samples: usize,
    /// Hash samples retained.
    pub history_len: usize,
    /// Deadline after which the best captured value is returned.
    pub timeout_ms: u64,
    /// How long the primary source may stay empty before the fallback is read.
    pub fallback_after_ms: Option<u64>,
}

impl Default for StabilizeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 275,
            sample_interval_ms: 250,
            stable_samples: 3,
            history_len: 4,
            timeout_ms: 120_000,
            fallback_after_ms: None,
        }
    }
}

impl StabilizeConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fallback_after(&self) -> Option<Duration> {
        self.fallback_after_ms.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 || self.sample_interval_ms == 0 {
            return Err(Error::Config(
                "stabilize.debounce_ms and sample_interval_ms must be at least 1".into(),
            ));
        }
        if self.stable_samples < MIN_STABLE_SAMPLES {
            return Err(Error::Config(format!(
                "stabilize.stable_samples must be at least {}",
                MIN_STABLE_SAMPLES
            )));
        }
        if self.history_len > MAX_HISTORY_LEN {
            return Err(Error::Config(format!(
                "stabilize.history_len must be at most {}",
                MAX_HISTORY_LEN
            )));
        }
        if self.history_len < self.stable_samples {
            return Err(Error::Config(
                "stabilize.history_len must be at least stable_samples".into(),
            ));
        }
        Ok(())
    }
}

/// Locators and anchors for one namespace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderCatalog {
    /// Version tag used when none has been detected.
    pub default_version: Option<String>,

    /// Ordered locator candidates per version tag, per target.
    #[serde(default)]
    pub versions: BTreeMap<String, HashMap<String, Vec<Locator>>>,

    /// Last-resort locators per target.
    #[serde(default)]
    pub emergency: HashMap<String, Vec<Locator>>,

    /// Anchor terms per target, merged into heuristic scoring.
    #[serde(default)]
    pub anchors: HashMap<String, Vec<String>>,

    /// End-markers per streaming target.
    #[serde(default)]
    pub end_markers: HashMap<String, Vec<EndMarkerSpec>>,
}

impl ProviderCatalog {
    fn validate(&self) -> Result<()> {
        if let Some(ref v) = self.default_version {
            if !self.versions.contains_key(v) {
                return Err(Error::Config(format!("default_version '{}' has no locators", v)));
            }
        }
        let lists = self
            .versions
            .values()
            .flat_map(|targets| targets.iter())
            .chain(self.emergency.iter());
        for (target, locators) in lists {
            if locators.iter().any(Locator::is_empty) {
                return Err(Error::Config(format!("empty locator for target '{}'", target)));
            }
        }
        Ok(())
    }

    /// Every target named anywhere in the catalog.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .versions
            .values()
            .flat_map(|t| t.keys())
            .chain(self.emergency.keys())
            .chain(self.anchors.keys())
            .chain(self.end_markers.keys())
            .map(String::as_str)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}
