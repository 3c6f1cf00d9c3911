//! Fire-and-forget diagnostics.

use crate::model::{Layer, ResolutionKey};
use crate::resolver::{FailureKind, ResolutionTrace};
use crate::stabilize::StabilizeStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Diagnostic event emitted by the engine. Never affects a returned result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    Resolved {
        trace: ResolutionTrace,
    },
    Exhausted {
        trace: ResolutionTrace,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<serde_json::Value>,
    },
    TimedOut {
        key: ResolutionKey,
        after_ms: u64,
    },
    Cancelled {
        key: ResolutionKey,
    },
    CacheInvalidated {
        key: ResolutionKey,
        reason: FailureKind,
    },
    Stabilized {
        key: ResolutionKey,
        status: StabilizeStatus,
        samples: u32,
        elapsed_ms: u64,
    },
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricEvent::Resolved { .. } => "resolved",
            MetricEvent::Exhausted { .. } => "exhausted",
            MetricEvent::TimedOut { .. } => "timed_out",
            MetricEvent::Cancelled { .. } => "cancelled",
            MetricEvent::CacheInvalidated { .. } => "cache_invalidated",
            MetricEvent::Stabilized { .. } => "stabilized",
        }
    }
}

/// Diagnostic sink. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: &MetricEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _event: &MetricEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn emit(&self, event: &MetricEvent) {
        match event {
            MetricEvent::Resolved { trace } => {
                let layer = trace.winner.map(|l: Layer| l.as_str()).unwrap_or("-");
                debug!(key = %trace.key, layer, duration_ms = trace.duration_ms, "resolved");
            }
            MetricEvent::Exhausted { trace, snapshot } => {
                let body = serde_json::to_string(trace).unwrap_or_default();
                warn!(key = %trace.key, has_snapshot = snapshot.is_some(), trace = %body, "all layers exhausted");
            }
            MetricEvent::TimedOut { key, after_ms } => {
                warn!(key = %key, after_ms, "resolution timed out");
            }
            MetricEvent::Cancelled { key } => {
                debug!(key = %key, "resolution cancelled");
            }
            MetricEvent::CacheInvalidated { key, reason } => {
                debug!(key = %key, reason = reason.as_str(), "cache entry invalidated");
            }
            MetricEvent::Stabilized {
                key,
                status,
                samples,
                elapsed_ms,
            } => {
                info!(key = %key, status = status.as_str(), samples, elapsed_ms, "stabilization finished");
            }
        }
    }
}
