//! Per-call resolution diagnostics.

use crate::model::{Layer, Locator, ResolutionKey};
use serde::Serialize;

/// Failure records kept per trace.
pub const MAX_FAILURES: usize = 32;

/// Why a single candidate or cache entry was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidLocatorSyntax,
    NotFound,
    NotInteractable,
    FingerprintMismatch,
    ConfidenceTooLow,
    Expired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidLocatorSyntax => "invalid_locator_syntax",
            FailureKind::NotFound => "not_found",
            FailureKind::NotInteractable => "not_interactable",
            FailureKind::FingerprintMismatch => "fingerprint_mismatch",
            FailureKind::ConfidenceTooLow => "confidence_too_low",
            FailureKind::Expired => "expired",
        }
    }
}

/// One rejected candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub layer: Layer,
    pub kind: FailureKind,
    /// Locator or heuristic name the failure applies to.
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Counters for one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    pub tried: u32,
    pub invalid: u32,
    pub not_found: u32,
    pub rejected: u32,
    pub success: u32,
    pub match_count: u32,
    pub duration_ms: u64,
}

/// A layer's place in a trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerTrace {
    pub layer: Layer,
    /// Set when the layer was not entered (e.g. `force_discovery`).
    pub skipped: bool,
    pub stats: LayerStats,
}

/// Everything that happened during one `resolve` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionTrace {
    pub key: ResolutionKey,
    /// Layers in the order they were reached.
    pub layers: Vec<LayerTrace>,
    pub winner: Option<Layer>,
    pub locator: Option<Locator>,
    pub failures: Vec<Failure>,
    /// Heuristic discovery passes, including the first.
    pub heuristic_passes: u32,
    pub duration_ms: u64,
}

impl ResolutionTrace {
    pub fn new(key: ResolutionKey) -> Self {
        Self {
            key,
            layers: Vec::with_capacity(Layer::ALL.len()),
            winner: None,
            locator: None,
            failures: Vec::new(),
            heuristic_passes: 0,
            duration_ms: 0,
        }
    }

    pub(crate) fn skip(&mut self, layer: Layer) {
        self.layers.push(LayerTrace {
            layer,
            skipped: true,
            stats: LayerStats::default(),
        });
    }

    pub(crate) fn record(&mut self, layer: Layer, stats: LayerStats) {
        self.layers.push(LayerTrace {
            layer,
            skipped: false,
            stats,
        });
    }

    pub(crate) fn fail(
        &mut self,
        layer: Layer,
        kind: FailureKind,
        subject: impl Into<String>,
        detail: Option<String>,
    ) {
        if self.failures.len() < MAX_FAILURES {
            self.failures.push(Failure {
                layer,
                kind,
                subject: subject.into(),
                detail,
            });
        }
    }

    /// Layers actually entered, in order.
    pub fn attempted(&self) -> Vec<Layer> {
        self.layers.iter().filter(|l| !l.skipped).map(|l| l.layer).collect()
    }

    /// Layers skipped, in order.
    pub fn skipped(&self) -> Vec<Layer> {
        self.layers.iter().filter(|l| l.skipped).map(|l| l.layer).collect()
    }

    pub fn stats(&self, layer: Layer) -> Option<&LayerStats> {
        self.layers.iter().find(|l| l.layer == layer).map(|l| &l.stats)
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}
