//! Structural fingerprints for stale-locator detection.
//!
//! A fingerprint records up to [`FINGERPRINT_DEPTH`] levels of a candidate's
//! ancestor chain. A cached locator is only trusted while the live candidate it
//! resolves to still has that shape.

use crate::model::{Fingerprint, LiveCandidate, NodeFeatures, FINGERPRINT_DEPTH, MAX_CLASS_HINTS};

/// Capture a fingerprint from a freshly found candidate.
pub fn capture(candidate: &LiveCandidate) -> Fingerprint {
    let levels = candidate
        .ancestry
        .iter()
        .take(FINGERPRINT_DEPTH)
        .map(|node| NodeFeatures {
            tag: node.tag.trim().to_lowercase(),
            stable_id: non_empty(&node.stable_id),
            role: non_empty(&node.role),
            label_hint: non_empty(&node.label_hint),
            class_hints: node
                .class_hints
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .take(MAX_CLASS_HINTS)
                .map(String::from)
                .collect(),
        })
        .collect();
    Fingerprint::new(levels)
}

/// Whether `live` still has the recorded shape.
///
/// Each recorded level must match on every attribute that was non-empty at
/// capture time; absent attributes are wildcards. A chain shorter than the
/// fingerprint never matches.
pub fn matches(fingerprint: &Fingerprint, live: &LiveCandidate) -> bool {
    if live.ancestry.len() < fingerprint.depth() {
        return false;
    }
    fingerprint
        .levels
        .iter()
        .zip(&live.ancestry)
        .all(|(recorded, node)| level_matches(recorded, node))
}

fn level_matches(recorded: &NodeFeatures, live: &NodeFeatures) -> bool {
    if !recorded.tag.is_empty() && !recorded.tag.eq_ignore_ascii_case(live.tag.trim()) {
        return false;
    }
    if !attr_matches(&recorded.stable_id, &live.stable_id)
        || !attr_matches(&recorded.role, &live.role)
        || !attr_matches(&recorded.label_hint, &live.label_hint)
    {
        return false;
    }
    recorded
        .class_hints
        .iter()
        .take(MAX_CLASS_HINTS)
        .all(|hint| live.class_hints.iter().any(|c| c == hint))
}

fn attr_matches(recorded: &Option<String>, live: &Option<String>) -> bool {
    match recorded.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(want) => live.as_deref().map(str::trim) == Some(want),
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
