//! Confidence scoring for heuristic candidates.

use crate::config::ResolverConfig;
use crate::driver::HeuristicMatch;
use crate::model::LiveCandidate;

/// Acceptance floor for heuristic candidates.
pub const MIN_CONFIDENCE: u8 = 75;

/// Confidence assumed when a heuristic returns a bare candidate.
pub const DEFAULT_CONFIDENCE: u8 = 80;

/// Bonus per distinct anchor term found on the candidate.
pub const ANCHOR_BOOST: u8 = 5;

/// Ceiling on the total anchor bonus.
pub const MAX_ANCHOR_BOOST: u8 = 15;

/// Scores heuristic candidates against anchor terms.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    pub min_confidence: u8,
    pub default_confidence: u8,
    pub anchor_boost: u8,
    pub max_anchor_boost: u8,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            min_confidence: MIN_CONFIDENCE,
            default_confidence: DEFAULT_CONFIDENCE,
            anchor_boost: ANCHOR_BOOST,
            max_anchor_boost: MAX_ANCHOR_BOOST,
        }
    }
}

impl ConfidenceScorer {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            default_confidence: config.default_confidence,
            anchor_boost: config.anchor_boost,
            max_anchor_boost: config.max_anchor_boost,
        }
    }

    /// Base confidence plus anchor bonus, clamped to 100.
    pub fn score(&self, found: &HeuristicMatch, anchors: &[String]) -> u8 {
        let base = found.confidence.unwrap_or(self.default_confidence).min(100) as u32;
        let hits = anchor_hits(&found.candidate, anchors) as u32;
        let boost = (hits * self.anchor_boost as u32).min(self.max_anchor_boost as u32);
        (base + boost).min(100) as u8
    }

    pub fn accepts(&self, score: u8) -> bool {
        score >= self.min_confidence
    }
}

/// Count distinct anchor terms (case-insensitive) present in the candidate's
/// text, label or placeholder.
fn anchor_hits(candidate: &LiveCandidate, anchors: &[String]) -> usize {
    let haystack = [
        candidate.text.as_str(),
        candidate.label.as_deref().unwrap_or(""),
        candidate.placeholder.as_deref().unwrap_or(""),
    ]
    .join("\n")
    .to_lowercase();

    let mut seen: Vec<String> = Vec::new();
    for anchor in anchors {
        let term = anchor.trim().to_lowercase();
        if term.is_empty() || seen.contains(&term) {
            continue;
        }
        if haystack.contains(&term) {
            seen.push(term);
        }
    }
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchors(terms: &[&str]) -> Vec<String> {
        terms.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_candidate_gets_default() {
        let scorer = ConfidenceScorer::default();
        let m = HeuristicMatch::bare(LiveCandidate::new("x"));
        assert_eq!(scorer.score(&m, &[]), DEFAULT_CONFIDENCE);
        assert!(scorer.accepts(DEFAULT_CONFIDENCE));
    }

    #[test]
    fn floor_is_inclusive() {
        let scorer = ConfidenceScorer::default();
        assert!(scorer.accepts(MIN_CONFIDENCE));
        assert!(!scorer.accepts(MIN_CONFIDENCE - 1));
    }

    #[test]
    fn anchors_boost_once_each() {
        let scorer = ConfidenceScorer::default();
        let c = LiveCandidate::new("x")
            .with_text("Send message")
            .with_placeholder("Ask anything");
        let m = HeuristicMatch::scored(c, 60);
        assert_eq!(scorer.score(&m, &anchors(&["send", "SEND", "Send"])), 65);
        assert_eq!(scorer.score(&m, &anchors(&["send", "ask"])), 70);
        assert_eq!(scorer.score(&m, &anchors(&["nothing"])), 60);
    }

    #[test]
    fn boost_is_capped() {
        let scorer = ConfidenceScorer::default();
        let c = LiveCandidate::new("x").with_text("a b c d e");
        let m = HeuristicMatch::scored(c, 50);
        assert_eq!(scorer.score(&m, &anchors(&["a", "b", "c", "d", "e"])), 65);
    }

    #[test]
    fn score_never_exceeds_100() {
        let scorer = ConfidenceScorer::default();
        let c = LiveCandidate::new("x").with_label("Stop generating");
        let m = HeuristicMatch::scored(c, 99);
        assert_eq!(scorer.score(&m, &anchors(&["stop"])), 100);
    }

    #[test]
    fn label_counts_as_anchor_text() {
        let scorer = ConfidenceScorer::default();
        let c = LiveCandidate::new("x").with_label("Send prompt");
        let m = HeuristicMatch::scored(c, 70);
        assert!(scorer.accepts(scorer.score(&m, &anchors(&["prompt"]))));
        assert!(!scorer.accepts(scorer.score(&m, &[])));
    }
}
