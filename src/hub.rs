//! C6 — Broadcast Hub. Coalesces a high-rate stream of logs and metrics
//! into batched `{type, data}` envelopes fanned out to every connected
//! WebSocket client (spec §4.6).
//!
//! Two ingest channels (log/metric, capacity 5000) feed one event loop
//! that buffers up to 100 items per kind or 500 ms, whichever comes
//! first, then serializes once and iterates the client set with a
//! non-blocking send. A client whose queue is full is dropped rather
//! than the message (slow-consumer policy = drop-client).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::compress;
use crate::models::{Log, RawMetricPoint};
use crate::telemetry::TelemetryRegistry;

const INGEST_CHANNEL_CAPACITY: usize = 5000;
const BATCH_MAX: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const CLIENT_QUEUE_CAPACITY: usize = 256;
/// Per-write timeout enforced by each client's writer task (spec §5).
pub const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastLog {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub severity: String,
    pub body: String,
    pub service_name: String,
    pub attributes: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&Log> for BroadcastLog {
    fn from(log: &Log) -> Self {
        let attrs = serde_json::from_str(&compress::decode(&log.attributes)).unwrap_or(serde_json::Value::Null);
        Self {
            trace_id: log.trace_id.clone(),
            span_id: log.span_id.clone(),
            severity: log.severity.clone(),
            body: compress::decode(&log.body),
            service_name: log.service_name.clone(),
            attributes: attrs,
            timestamp: log.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMetric {
    pub metric_name: String,
    pub service_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

impl From<&RawMetricPoint> for BroadcastMetric {
    fn from(p: &RawMetricPoint) -> Self {
        Self {
            metric_name: p.metric_name.clone(),
            service_name: p.service_name.clone(),
            value: p.value,
            timestamp: p.timestamp,
            attributes: p.attributes.clone(),
        }
    }
}

type ClientMap = Mutex<HashMap<u64, mpsc::Sender<Arc<String>>>>;

pub struct BroadcastHub {
    clients: ClientMap,
    next_client_id: AtomicU64,
    log_tx: Mutex<Option<mpsc::Sender<Log>>>,
    metric_tx: Mutex<Option<mpsc::Sender<RawMetricPoint>>>,
    telemetry: Arc<TelemetryRegistry>,
    stopped: Arc<AtomicBool>,
    worker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BroadcastHub {
    pub fn start(telemetry: Arc<TelemetryRegistry>) -> Arc<Self> {
        let (log_tx, log_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let (metric_tx, metric_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

        let hub = Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            log_tx: Mutex::new(Some(log_tx)),
            metric_tx: Mutex::new(Some(metric_tx)),
            telemetry,
            stopped: Arc::new(AtomicBool::new(false)),
            worker_task: Mutex::new(None),
        });

        let worker = {
            let clients = Arc::clone(&hub);
            tokio::spawn(async move { clients.run(log_rx, metric_rx).await })
        };
        *hub.worker_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);

        hub
    }

    async fn run(self: Arc<Self>, mut log_rx: mpsc::Receiver<Log>, mut metric_rx: mpsc::Receiver<RawMetricPoint>) {
        let mut log_buf = Vec::with_capacity(BATCH_MAX);
        let mut metric_buf = Vec::with_capacity(BATCH_MAX);
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                maybe_log = log_rx.recv() => {
                    match maybe_log {
                        Some(log) => {
                            log_buf.push(log);
                            if log_buf.len() >= BATCH_MAX {
                                self.flush_logs(std::mem::take(&mut log_buf));
                            }
                        }
                        None => break,
                    }
                }
                maybe_point = metric_rx.recv() => {
                    match maybe_point {
                        Some(point) => {
                            metric_buf.push(point);
                            if metric_buf.len() >= BATCH_MAX {
                                self.flush_metrics(std::mem::take(&mut metric_buf));
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    if !log_buf.is_empty() {
                        self.flush_logs(std::mem::take(&mut log_buf));
                    }
                    if !metric_buf.is_empty() {
                        self.flush_metrics(std::mem::take(&mut metric_buf));
                    }
                    if self.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }

        // Final flush on shutdown (spec §4.6).
        if !log_buf.is_empty() {
            self.flush_logs(log_buf);
        }
        if !metric_buf.is_empty() {
            self.flush_metrics(metric_buf);
        }
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn flush_logs(&self, batch: Vec<Log>) {
        let views: Vec<BroadcastLog> = batch.iter().map(BroadcastLog::from).collect();
        self.broadcast("logs", &views);
    }

    fn flush_metrics(&self, batch: Vec<RawMetricPoint>) {
        let views: Vec<BroadcastMetric> = batch.iter().map(BroadcastMetric::from).collect();
        self.broadcast("metrics", &views);
    }

    fn broadcast<T: Serialize>(&self, kind: &str, data: &[T]) {
        let envelope = serde_json::json!({ "type": kind, "data": data });
        let text = Arc::new(envelope.to_string());
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|_, tx| tx.try_send(text.clone()).is_ok());
    }

    /// Registers a new client and returns its id plus the receiving half
    /// of its send-queue, which the caller's writer task drains.
    pub fn register_client(&self) -> (u64, mpsc::Receiver<Arc<String>>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).insert(id, tx);
        self.telemetry.inc_active_connections();
        (id, rx)
    }

    pub fn unregister_client(&self, id: u64) {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        self.telemetry.dec_active_connections();
    }

    /// Non-blocking; an overloaded ingest channel drops the event and
    /// logs it rather than stalling the ingestion path (spec §4.5, §7).
    pub fn ingest_log(&self, log: Log) {
        let guard = self.log_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(log).is_err() {
                warn!("broadcast hub: log ingest channel full or closed, dropping event");
            }
        }
    }

    pub fn ingest_metric(&self, point: RawMetricPoint) {
        let guard = self.metric_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(point).is_err() {
                warn!("broadcast hub: metric ingest channel full or closed, dropping event");
            }
        }
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.log_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.metric_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.worker_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> Log {
        Log {
            id: 0,
            trace_id: None,
            span_id: None,
            severity: "INFO".to_string(),
            body: compress::encode("hello"),
            service_name: "svc".to_string(),
            attributes: compress::encode_attributes(&serde_json::json!({})),
            timestamp: Utc::now(),
            insight: None,
        }
    }

    #[tokio::test]
    async fn registered_client_receives_a_batched_log_envelope() {
        let hub = BroadcastHub::start(Arc::new(TelemetryRegistry::new()));
        let (_id, mut rx) = hub.register_client();

        hub.ingest_log(sample_log());
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "logs");
        assert_eq!(value["data"][0]["body"], "hello");

        hub.stop().await;
    }

    #[tokio::test]
    async fn a_full_client_queue_is_dropped_not_the_message() {
        let hub = BroadcastHub::start(Arc::new(TelemetryRegistry::new()));
        let (id, _rx) = hub.register_client(); // receiver never drained

        for _ in 0..(CLIENT_QUEUE_CAPACITY + BATCH_MAX + 10) {
            hub.ingest_log(sample_log());
        }
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!hub.clients.lock().unwrap().contains_key(&id));

        hub.stop().await;
    }
}
