//! Core data model: keys, locators, fingerprints, and cache records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of ancestor levels captured in a fingerprint.
pub const FINGERPRINT_DEPTH: usize = 3;

/// Class hints kept per fingerprint level.
pub const MAX_CLASS_HINTS: usize = 3;

/// Identifies "this kind of thing, in this context".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolutionKey {
    /// Provider or page context (e.g. `"chatgpt"`).
    pub namespace: String,
    /// Logical target within the namespace (e.g. `"composer"`).
    pub target_id: String,
}

impl ResolutionKey {
    pub fn new(namespace: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            target_id: target_id.into(),
        }
    }

    /// Key under which the entry is persisted in a `KvStore`.
    ///
    /// `:` and `%` in the namespace are percent-escaped so the first `::`
    /// always separates the two parts.
    pub fn storage_key(&self) -> String {
        let ns = self.namespace.replace('%', "%25").replace(':', "%3A");
        format!("{}::{}", ns, self.target_id)
    }

    /// Inverse of [`storage_key`](Self::storage_key).
    pub fn from_storage_key(s: &str) -> Option<Self> {
        let (ns, id) = s.split_once("::")?;
        if ns.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(ns.replace("%3A", ":").replace("%25", "%"), id))
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.target_id)
    }
}

/// Opaque value understood only by the [`Driver`](crate::Driver) that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Locator {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for Locator {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolution strategy that produced a candidate. Declaration order is attempt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Cached,
    Versioned,
    Heuristic,
    Emergency,
}

impl Layer {
    /// All layers in attempt order.
    pub const ALL: [Layer; 4] = [
        Layer::Cached,
        Layer::Versioned,
        Layer::Heuristic,
        Layer::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Cached => "cached",
            Layer::Versioned => "versioned",
            Layer::Heuristic => "heuristic",
            Layer::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural features of one node in an ancestor chain.
///
/// Empty / `None` fields are wildcards when the features are part of a
/// recorded [`Fingerprint`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeatures {
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_hints: Vec<String>,
}

impl NodeFeatures {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.stable_id = Some(id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label_hint = Some(label.into());
        self
    }

    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.class_hints = classes.into_iter().map(Into::into).collect();
        self
    }
}

/// Captured shape of a candidate's ancestor chain, nearest node first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint {
    pub levels: Vec<NodeFeatures>,
}

impl Fingerprint {
    pub fn new(levels: Vec<NodeFeatures>) -> Self {
        Self { levels }
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// A live object returned by a driver, with enough metadata for the core to
/// fingerprint, score and describe it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveCandidate {
    /// Locator that finds this object again.
    pub locator: Locator,
    /// The node itself at index 0, then its ancestors outward.
    #[serde(default)]
    pub ancestry: Vec<NodeFeatures>,
    /// Visible text (may be truncated by the driver).
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl LiveCandidate {
    pub fn new(locator: impl Into<Locator>) -> Self {
        Self {
            locator: locator.into(),
            ..Default::default()
        }
    }

    pub fn with_ancestry(mut self, ancestry: Vec<NodeFeatures>) -> Self {
        self.ancestry = ancestry;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Outcome of a successful layer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub locator: Locator,
    pub layer: Layer,
    pub fingerprint: Fingerprint,
    /// 0-100.
    pub confidence: u8,
    /// Milliseconds since the Unix epoch.
    pub discovered_at: i64,
}

/// A stored record plus its expiry. Replaced or removed, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(flatten)]
    pub record: CandidateRecord,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_round_trips() {
        let key = ResolutionKey::new("chatgpt", "composer");
        assert_eq!(key.storage_key(), "chatgpt::composer");
        assert_eq!(ResolutionKey::from_storage_key("chatgpt::composer"), Some(key));
        assert_eq!(ResolutionKey::from_storage_key("nope"), None);
        assert_eq!(ResolutionKey::from_storage_key("::composer"), None);
    }

    #[test]
    fn storage_key_survives_separator_in_namespace() {
        for key in [
            ResolutionKey::new("corp::chat", "composer"),
            ResolutionKey::new("50%:off", "send::primary"),
            ResolutionKey::new("a%3Ab", "x"),
        ] {
            let stored = key.storage_key();
            assert_eq!(ResolutionKey::from_storage_key(&stored), Some(key));
        }
        assert_eq!(ResolutionKey::new("chatgpt", "composer").storage_key(), "chatgpt::composer");
    }

    #[test]
    fn candidate_defaults_to_empty_locator() {
        let c = LiveCandidate::new("#prompt");
        assert_eq!(c.locator.as_str(), "#prompt");
        assert!(LiveCandidate::default().locator.is_empty());
    }

    #[test]
    fn layer_order_is_attempt_order() {
        let mut layers = Layer::ALL.to_vec();
        layers.reverse();
        layers.sort();
        assert_eq!(layers, Layer::ALL.to_vec());
    }

    #[test]
    fn cache_entry_persists_flat_schema() {
        let entry = CacheEntry {
            record: CandidateRecord {
                locator: "#prompt".into(),
                layer: Layer::Heuristic,
                fingerprint: Fingerprint::new(vec![NodeFeatures::tag("textarea")]),
                confidence: 85,
                discovered_at: 1_000,
            },
            expires_at: 2_000,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["locator"], "#prompt");
        assert_eq!(json["layer"], "heuristic");
        assert_eq!(json["confidence"], 85);
        assert_eq!(json["discoveredAt"], 1_000);
        assert_eq!(json["expiresAt"], 2_000);
        assert_eq!(json["fingerprint"][0]["tag"], "textarea");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn expiry_boundary() {
        let entry = CacheEntry {
            record: CandidateRecord {
                locator: "a".into(),
                layer: Layer::Versioned,
                fingerprint: Fingerprint::default(),
                confidence: 100,
                discovered_at: 0,
            },
            expires_at: 100,
        };
        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
    }
}
