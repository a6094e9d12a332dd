//! C7 — Event Hub. Computes per-service "last 15 minutes" live snapshots
//! on a cadence and pushes filtered log/metric deltas between snapshots
//! (spec §4.7).
//!
//! Two independent timers share one event loop: a 5 s snapshot loop that
//! only runs when `notify_refresh` has set the pending flag and at least
//! one client is connected, and a 500 ms batch loop that slices the
//! accumulated log/metric buffers per client's service filter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::RepositoryError;
use crate::hub::{BroadcastLog, BroadcastMetric};
use crate::models::{Log, LiveSnapshot, RawMetricPoint, SortField, SortOrder, TraceFilter};
use crate::repository::Repository;
use crate::telemetry::TelemetryRegistry;

const INGEST_CHANNEL_CAPACITY: usize = 1000;
const BATCH_INTERVAL: Duration = Duration::from_millis(500);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_WINDOW: Duration = Duration::from_secs(15 * 60);
const CLIENT_QUEUE_CAPACITY: usize = 64;
const TOP_TRACES_LIMIT: i64 = 25;

/// Per-write timeout enforced by a client's writer task on `/ws/events`
/// sockets (spec §5).
pub const EVENT_CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

struct ClientState {
    tx: mpsc::Sender<Arc<String>>,
    service: Mutex<String>,
}

pub struct EventHub {
    clients: Mutex<HashMap<u64, ClientState>>,
    next_client_id: AtomicU64,
    log_tx: Mutex<Option<mpsc::Sender<Log>>>,
    metric_tx: Mutex<Option<mpsc::Sender<RawMetricPoint>>>,
    pending: AtomicBool,
    stopped: Arc<AtomicBool>,
    repo: Arc<dyn Repository>,
    telemetry: Arc<TelemetryRegistry>,
    worker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

async fn compute_snapshot(repo: &Arc<dyn Repository>, service: &str) -> Result<LiveSnapshot, RepositoryError> {
    let end = Utc::now();
    let start = end - chrono::Duration::from_std(SNAPSHOT_WINDOW).unwrap_or(chrono::Duration::minutes(15));
    let services: Vec<String> = if service.is_empty() { vec![] } else { vec![service.to_string()] };

    let dashboard = repo.get_dashboard_stats(start, end, &services).await?;
    let traffic = repo.get_traffic_metrics(start, end, &services).await?;
    let service_map = repo.get_service_map_metrics(start, end).await?;

    let filter = TraceFilter {
        start,
        end,
        services: services.clone(),
        status: None,
        search: None,
        limit: TOP_TRACES_LIMIT,
        offset: 0,
        sort_by: SortField::Timestamp,
        order: SortOrder::Desc,
    };
    let top_traces = repo.get_traces_filtered(filter).await?.traces;

    Ok(LiveSnapshot {
        service: (!service.is_empty()).then(|| service.to_string()),
        dashboard,
        traffic,
        top_traces,
        service_map,
    })
}

impl EventHub {
    pub fn start(repo: Arc<dyn Repository>, telemetry: Arc<TelemetryRegistry>) -> Arc<Self> {
        let (log_tx, log_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let (metric_tx, metric_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

        let hub = Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            log_tx: Mutex::new(Some(log_tx)),
            metric_tx: Mutex::new(Some(metric_tx)),
            pending: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            repo,
            telemetry,
            worker_task: Mutex::new(None),
        });

        let worker = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.run(log_rx, metric_rx).await })
        };
        *hub.worker_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);

        hub
    }

    async fn run(self: Arc<Self>, mut log_rx: mpsc::Receiver<Log>, mut metric_rx: mpsc::Receiver<RawMetricPoint>) {
        let mut log_buf: Vec<Log> = Vec::new();
        let mut metric_buf: Vec<RawMetricPoint> = Vec::new();
        let mut batch_tick = tokio::time::interval(BATCH_INTERVAL);
        let mut snapshot_tick = tokio::time::interval(SNAPSHOT_INTERVAL);

        loop {
            tokio::select! {
                maybe_log = log_rx.recv() => {
                    match maybe_log {
                        Some(log) => log_buf.push(log),
                        None => break,
                    }
                }
                maybe_point = metric_rx.recv() => {
                    match maybe_point {
                        Some(point) => metric_buf.push(point),
                        None => break,
                    }
                }
                _ = batch_tick.tick() => {
                    self.flush_batches(std::mem::take(&mut log_buf), std::mem::take(&mut metric_buf));
                }
                _ = snapshot_tick.tick() => {
                    self.maybe_snapshot().await;
                    if self.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        self.flush_batches(log_buf, metric_buf);
    }

    fn flush_batches(&self, logs: Vec<Log>, metrics: Vec<RawMetricPoint>) {
        if logs.is_empty() && metrics.is_empty() {
            return;
        }
        let members: Vec<(u64, String, mpsc::Sender<Arc<String>>)> = {
            let guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .map(|(id, c)| (*id, c.service.lock().unwrap_or_else(|e| e.into_inner()).clone(), c.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, service, tx) in members {
            if !logs.is_empty() {
                let filtered: Vec<BroadcastLog> = logs
                    .iter()
                    .filter(|l| service.is_empty() || l.service_name == service)
                    .map(BroadcastLog::from)
                    .collect();
                if !filtered.is_empty() {
                    let text = Arc::new(serde_json::json!({ "type": "logs", "data": filtered }).to_string());
                    if tx.try_send(text).is_err() {
                        dead.push(id);
                        continue;
                    }
                }
            }
            if !metrics.is_empty() {
                let filtered: Vec<BroadcastMetric> = metrics
                    .iter()
                    .filter(|p| service.is_empty() || p.service_name == service)
                    .map(BroadcastMetric::from)
                    .collect();
                if !filtered.is_empty() {
                    let text = Arc::new(serde_json::json!({ "type": "metrics", "data": filtered }).to_string());
                    if tx.try_send(text).is_err() {
                        dead.push(id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                guard.remove(&id);
            }
        }
    }

    /// Groups connected clients by service filter so that clients sharing
    /// a filter share one computation (spec §4.7 "all clients sharing a
    /// service share one computation").
    async fn maybe_snapshot(&self) {
        if self.clients.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
            return;
        }
        if !self.pending.swap(false, Ordering::AcqRel) {
            return;
        }

        let groups: HashMap<String, Vec<(u64, mpsc::Sender<Arc<String>>)>> = {
            let guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let mut groups: HashMap<String, Vec<(u64, mpsc::Sender<Arc<String>>)>> = HashMap::new();
            for (id, c) in guard.iter() {
                let svc = c.service.lock().unwrap_or_else(|e| e.into_inner()).clone();
                groups.entry(svc).or_default().push((*id, c.tx.clone()));
            }
            groups
        };

        let mut dead = Vec::new();
        for (service, members) in groups {
            let snapshot = match compute_snapshot(&self.repo, &service).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, service, "event hub: snapshot computation failed");
                    continue;
                }
            };
            let text = Arc::new(serde_json::to_string(&snapshot).unwrap_or_default());
            for (id, tx) in members {
                if tx.try_send(text.clone()).is_err() {
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                guard.remove(&id);
            }
        }
    }

    /// Registers a client with its initial service filter and marks a
    /// refresh pending so the next snapshot tick includes its group.
    pub fn register_client(&self, initial_service: String) -> (u64, mpsc::Receiver<Arc<String>>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ClientState { tx, service: Mutex::new(initial_service) });
        self.telemetry.inc_active_connections();
        self.notify_refresh();
        (id, rx)
    }

    pub fn unregister_client(&self, id: u64) {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        self.telemetry.dec_active_connections();
    }

    /// Malformed in-band filter messages are ignored without closing the
    /// connection (spec §7 "protocol" errors).
    pub fn set_client_service(&self, id: u64, service: String) {
        let guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = guard.get(&id) {
            *client.service.lock().unwrap_or_else(|e| e.into_inner()) = service;
        }
        drop(guard);
        self.notify_refresh();
    }

    /// Computes the one immediate snapshot sent on client connect (spec
    /// §4.7 "Client protocol").
    pub async fn snapshot_for(&self, service: &str) -> Result<LiveSnapshot, RepositoryError> {
        compute_snapshot(&self.repo, service).await
    }

    pub fn ingest_log(&self, log: Log) {
        let guard = self.log_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(log).is_err() {
                warn!("event hub: log ingest channel full or closed, dropping event");
            }
        }
        drop(guard);
        self.notify_refresh();
    }

    pub fn ingest_metric(&self, point: RawMetricPoint) {
        let guard = self.metric_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(point).is_err() {
                warn!("event hub: metric ingest channel full or closed, dropping event");
            }
        }
        drop(guard);
        self.notify_refresh();
    }

    fn notify_refresh(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.log_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.metric_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.worker_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = task.await;
        }
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;

    #[tokio::test]
    async fn a_repeat_notify_refresh_collapses_into_one_pending_flag() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let hub = EventHub::start(repo, Arc::new(TelemetryRegistry::new()));
        hub.notify_refresh();
        hub.notify_refresh();
        assert!(hub.pending.load(Ordering::Acquire));
        hub.stop().await;
    }

    #[tokio::test]
    async fn unknown_client_service_update_is_a_silent_no_op() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let hub = EventHub::start(repo, Arc::new(TelemetryRegistry::new()));
        hub.set_client_service(999, "svc".to_string());
        hub.stop().await;
    }

    #[tokio::test]
    async fn two_clients_with_distinct_filters_form_two_groups() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let hub = EventHub::start(repo, Arc::new(TelemetryRegistry::new()));
        let (_a, _rx_a) = hub.register_client("order-service".to_string());
        let (_b, _rx_b) = hub.register_client(String::new());

        let groups: std::collections::HashSet<String> = hub
            .clients
            .lock()
            .unwrap()
            .values()
            .map(|c| c.service.lock().unwrap().clone())
            .collect();
        assert_eq!(groups.len(), 2);
        hub.stop().await;
    }
}
