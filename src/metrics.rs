//! In-process operational metrics.
//!
//! Lock-free counters and fixed-bucket latency histograms for the tool
//! surface, plus assembly of the `check_health` snapshot. Everything here is
//! process-local; there is no exporter — the snapshot is the export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::embedding::EmbedSnapshot;

/// Histogram bucket upper bounds in milliseconds; the last bucket is open.
const LATENCY_BUCKETS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    total_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe_ms(&self, ms: u64) {
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ms: self.total_ms.load(Ordering::Relaxed),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub total_ms: u64,
    /// Counts per bucket: `<=1ms, <=5ms, …, <=1000ms, >1000ms`.
    pub buckets: Vec<u64>,
}

/// Per-tool request/error counters with a latency histogram.
#[derive(Debug, Default)]
pub struct ToolMetrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub latency: LatencyHistogram,
}

impl ToolMetrics {
    /// Record one completed call.
    pub fn record(&self, started: Instant, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.observe_ms(started.elapsed().as_millis() as u64);
    }
}

/// All server metrics, one field per tool.
#[derive(Debug, Default)]
pub struct Metrics {
    pub search: ToolMetrics,
    pub lookup: ToolMetrics,
    pub similar: ToolMetrics,
    pub ingest: ToolMetrics,
    pub health: ToolMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub latency: LatencySnapshot,
}

fn tool_snapshot(tool: &ToolMetrics) -> ToolSnapshot {
    ToolSnapshot {
        requests: tool.requests.load(Ordering::Relaxed),
        errors: tool.errors.load(Ordering::Relaxed),
        latency: tool.latency.snapshot(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub search: ToolSnapshot,
    pub lookup: ToolSnapshot,
    pub similar: ToolSnapshot,
    pub ingest: ToolSnapshot,
    pub health: ToolSnapshot,
    pub embedding: EmbedSnapshot,
}

impl Metrics {
    pub fn snapshot(&self, embedding: EmbedSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            search: tool_snapshot(&self.search),
            lookup: tool_snapshot(&self.lookup),
            similar: tool_snapshot(&self.similar),
            ingest: tool_snapshot(&self.ingest),
            health: tool_snapshot(&self.health),
            embedding,
        }
    }
}

/// Payload of the `check_health` tool.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub store_reachable: bool,
    pub doc_count: i64,
    pub step_count: i64,
    pub embed_provider_ok: bool,
    /// ISO timestamp of the last successful embedding call, if any.
    pub last_successful_embed_at: Option<String>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_places_observations_in_buckets() {
        let histogram = LatencyHistogram::default();
        histogram.observe_ms(0);
        histogram.observe_ms(1);
        histogram.observe_ms(7);
        histogram.observe_ms(5000);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.buckets[0], 2); // <= 1ms
        assert_eq!(snapshot.buckets[2], 1); // <= 10ms
        assert_eq!(snapshot.buckets[LATENCY_BUCKETS_MS.len()], 1); // overflow
        assert_eq!(snapshot.total_ms, 5008);
    }

    #[test]
    fn tool_metrics_track_errors() {
        let tool = ToolMetrics::default();
        tool.record(Instant::now(), true);
        tool.record(Instant::now(), false);
        let snapshot = tool_snapshot(&tool);
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.latency.count, 2);
    }
}
