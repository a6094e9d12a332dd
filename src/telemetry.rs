//! C1 — Telemetry Registry. Counters/gauges/histograms with an atomic
//! back-store so health-JSON reads never take a metrics lock (spec §4.1,
//! §5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Bounded reservoir used to estimate p99 DB latency without pulling in a
/// histogram crate the rest of the stack does not already carry.
const LATENCY_WINDOW: usize = 2048;

pub struct TelemetryRegistry {
    ingested_total: AtomicU64,
    active_connections: AtomicI64,
    dlq_size: AtomicU64,
    db_latency_p99_ms_bits: AtomicU64,
    db_latency_window: Mutex<VecDeque<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ingestion_rate_total: u64,
    pub dlq_size: u64,
    pub active_connections: i64,
    pub db_latency_p99_ms: f64,
}

impl Default for TelemetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self {
            ingested_total: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            dlq_size: AtomicU64::new(0),
            db_latency_p99_ms_bits: AtomicU64::new(0f64.to_bits()),
            db_latency_window: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_ingestion(&self, n: u64) {
        self.ingested_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_active_connections(&self, n: i64) {
        self.active_connections.store(n.max(0), Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        // Guard against drifting negative on a double-decrement race.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some((v - 1).max(0))
            });
    }

    pub fn set_dlq_size(&self, n: u64) {
        self.dlq_size.store(n, Ordering::Relaxed);
    }

    /// Record one DB-operation latency observation (seconds) and refresh the
    /// atomic p99-in-ms snapshot used by the JSON health surface.
    pub fn observe_db_latency(&self, seconds: f64) {
        let ms = seconds * 1000.0;
        let mut window = self.db_latency_window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);

        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        let idx = idx.saturating_sub(1).min(sorted.len().saturating_sub(1));
        let p99 = sorted.get(idx).copied().unwrap_or(0.0);
        self.db_latency_p99_ms_bits
            .store(p99.to_bits(), Ordering::Relaxed);
    }

    pub fn get_health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ingestion_rate_total: self.ingested_total.load(Ordering::Relaxed),
            dlq_size: self.dlq_size.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            db_latency_p99_ms: f64::from_bits(
                self.db_latency_p99_ms_bits.load(Ordering::Relaxed),
            ),
        }
    }

    /// Prometheus-style text exposition for the `/metrics` scrape endpoint.
    pub fn render_prometheus_text(&self) -> String {
        let snap = self.get_health_snapshot();
        format!(
            "# HELP argus_ingested_total Total telemetry records ingested.\n\
             # TYPE argus_ingested_total counter\n\
             argus_ingested_total {}\n\
             # HELP argus_dlq_size Current number of items pending in the dead-letter queue.\n\
             # TYPE argus_dlq_size gauge\n\
             argus_dlq_size {}\n\
             # HELP argus_active_connections Currently connected WebSocket clients.\n\
             # TYPE argus_active_connections gauge\n\
             argus_active_connections {}\n\
             # HELP argus_db_latency_p99_ms p99 database operation latency in milliseconds.\n\
             # TYPE argus_db_latency_p99_ms gauge\n\
             argus_db_latency_p99_ms {}\n",
            snap.ingestion_rate_total, snap.dlq_size, snap.active_connections, snap.db_latency_p99_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_never_go_negative() {
        let reg = TelemetryRegistry::new();
        reg.dec_active_connections();
        assert_eq!(reg.get_health_snapshot().active_connections, 0);
    }

    #[test]
    fn p99_of_uniform_samples_is_near_max() {
        let reg = TelemetryRegistry::new();
        for i in 1..=100 {
            reg.observe_db_latency(i as f64 / 1000.0);
        }
        let snap = reg.get_health_snapshot();
        assert!(snap.db_latency_p99_ms >= 98.0);
    }

    #[test]
    fn health_snapshot_tracks_ingestion() {
        let reg = TelemetryRegistry::new();
        reg.record_ingestion(5);
        reg.record_ingestion(3);
        assert_eq!(reg.get_health_snapshot().ingestion_rate_total, 8);
    }
}
