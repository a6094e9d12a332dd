//! C4 — TSDB Aggregator. Folds a stream of raw metric points into
//! tumbling windows of fixed size `W` (default 30s), then flushes sealed
//! buckets to C2 (spec §4.4).
//!
//! The open-bucket map is a plain mutex-guarded `HashMap`, not a
//! `DashMap`: the flush path needs to atomically swap the *whole* map
//! aside, which a sharded map cannot do without briefly locking every
//! shard anyway. The mutex is only ever held for the O(n) swap or a
//! single-key update, never across I/O (spec §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::compress;
use crate::models::{MetricBucket, RawMetricPoint};
use crate::repository::Repository;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Channel depth for sealed batches handed to the persistence worker.
const FLUSH_CHANNEL_CAPACITY: usize = 64;
/// Cap on how many emptied `Vec<MetricBucket>` the pool keeps around.
const POOL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
struct OpenBucket {
    metric_name: String,
    service_name: String,
    bucket_start: DateTime<Utc>,
    min: f64,
    max: f64,
    sum: f64,
    count: i64,
    /// Raw attribute map, compressed lazily only when the bucket seals.
    attributes: serde_json::Value,
}

impl OpenBucket {
    fn seal(self) -> MetricBucket {
        MetricBucket {
            metric_name: self.metric_name,
            service_name: self.service_name,
            bucket_start: self.bucket_start,
            min: self.min,
            max: self.max,
            sum: self.sum,
            count: self.count,
            attributes: compress::encode_attributes(&self.attributes),
        }
    }
}

fn floor_to_window(t: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let w = window.as_secs().max(1) as i64;
    let secs = t.timestamp();
    let floored = secs - secs.rem_euclid(w);
    Utc.timestamp_opt(floored, 0).unwrap()
}

/// Stable key: `service | name | fingerprint`. Two points collide iff
/// their keys are byte-equal (spec §3). The fingerprint is the
/// sorted-key canonical JSON of the attribute map (SPEC_FULL.md §D.1),
/// so iteration-order differences in the source map never split a
/// bucket that should be one.
fn bucket_key(point: &RawMetricPoint) -> String {
    format!(
        "{}\u{1}{}\u{1}{}",
        point.service_name,
        point.metric_name,
        compress::canonical_json(&point.attributes)
    )
}

pub struct TsdbAggregator {
    window: Duration,
    open: Mutex<HashMap<String, OpenBucket>>,
    pool: Mutex<Vec<Vec<MetricBucket>>>,
    /// `None` once `stop()` has closed the channel, so the persistence
    /// worker can observe end-of-stream and exit.
    flush_tx: Mutex<Option<mpsc::Sender<Vec<MetricBucket>>>>,
    stopped: Arc<AtomicBool>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    worker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TsdbAggregator {
    pub fn start(repo: Arc<dyn Repository>, window: Duration) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);

        let aggregator = Arc::new(Self {
            window,
            open: Mutex::new(HashMap::new()),
            pool: Mutex::new(Vec::with_capacity(POOL_CAPACITY)),
            flush_tx: Mutex::new(Some(flush_tx)),
            stopped: Arc::new(AtomicBool::new(false)),
            flush_task: Mutex::new(None),
            worker_task: Mutex::new(None),
        });

        let worker_task = tokio::spawn(persistence_worker(repo, flush_rx));
        *aggregator.worker_task.try_lock().unwrap() = Some(worker_task);

        let ticker = aggregator.clone();
        let flush_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ticker.window);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                if ticker.stopped.load(Ordering::Relaxed) {
                    break;
                }
                ticker.flush();
            }
        });
        *aggregator.flush_task.try_lock().unwrap() = Some(flush_task);

        aggregator
    }

    /// Folds one raw point into its window bucket (spec §4.4 `ingest`).
    /// Commutative across points in the same window: order never affects
    /// the sealed result.
    pub fn ingest(&self, point: RawMetricPoint) {
        let key = bucket_key(&point);
        let bucket_start = floor_to_window(point.timestamp, self.window);
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        open.entry(key)
            .and_modify(|b| {
                b.min = b.min.min(point.value);
                b.max = b.max.max(point.value);
                b.sum += point.value;
                b.count += 1;
            })
            .or_insert_with(|| OpenBucket {
                metric_name: point.metric_name.clone(),
                service_name: point.service_name.clone(),
                bucket_start,
                min: point.value,
                max: point.value,
                sum: point.value,
                count: 1,
                attributes: point.attributes.clone(),
            });
    }

    fn take_pooled(&self) -> Vec<MetricBucket> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).pop().unwrap_or_default()
    }

    fn return_pooled(&self, mut v: Vec<MetricBucket>) {
        v.clear();
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < POOL_CAPACITY {
            pool.push(v);
        }
    }

    /// Atomically moves the open-bucket map aside, seals it into a batch,
    /// and hands it to the persistence worker. Back-pressure policy:
    /// dropped-on-floor if the flush channel is full (spec §4.4, §9).
    fn flush(&self) {
        let sealed = {
            let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *open)
        };
        if sealed.is_empty() {
            return;
        }

        let mut batch = self.take_pooled();
        batch.extend(sealed.into_values().map(OpenBucket::seal));

        let guard = self.flush_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            warn!(buckets = batch.len(), "tsdb: channel already closed, dropping sealed batch");
            return;
        };
        match tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    buckets = dropped.len(),
                    "tsdb: flush channel full, dropping sealed batch (metric durability not guaranteed)"
                );
                drop(guard);
                self.return_pooled(dropped);
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                warn!(buckets = dropped.len(), "tsdb: persistence worker gone, dropping sealed batch");
            }
        }
    }

    /// Shutdown sequence: a final flush must run before the repository is
    /// torn down, or the last open window's buckets are lost (spec §9).
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(task) = self.flush_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.flush();
        // Drop the sender so the persistence worker observes end-of-stream,
        // drains whatever is already queued, and exits.
        self.flush_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.worker_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = task.await;
        }
    }
}

async fn persistence_worker(repo: Arc<dyn Repository>, mut rx: mpsc::Receiver<Vec<MetricBucket>>) {
    while let Some(batch) = rx.recv().await {
        if batch.is_empty() {
            continue;
        }
        let n = batch.len();
        match repo.batch_create_metric_buckets(&batch).await {
            Ok(()) => debug!(buckets = n, "tsdb: flushed sealed batch"),
            Err(e) => warn!(error = %e, buckets = n, "tsdb: persistence failed, batch discarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;
    use crate::telemetry::TelemetryRegistry;

    fn point(name: &str, service: &str, t: i64, v: f64) -> RawMetricPoint {
        RawMetricPoint {
            metric_name: name.to_string(),
            service_name: service.to_string(),
            value: v,
            timestamp: Utc.timestamp_opt(t, 0).unwrap(),
            attributes: serde_json::json!({}),
        }
    }

    #[test]
    fn commutative_min_max_sum_count_within_a_window() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let agg = TsdbAggregator::start(repo, Duration::from_secs(30));

        agg.ingest(point("orders_processed_total", "order-service", 0, 1.0));
        agg.ingest(point("orders_processed_total", "order-service", 10, 2.0));
        agg.ingest(point("orders_processed_total", "order-service", 20, 3.0));

        let open = agg.open.lock().unwrap();
        let bucket = open.values().next().unwrap();
        assert_eq!(bucket.min, 1.0);
        assert_eq!(bucket.max, 3.0);
        assert_eq!(bucket.sum, 6.0);
        assert_eq!(bucket.count, 3);
        assert_eq!(bucket.bucket_start, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn a_new_point_past_the_window_opens_a_new_bucket() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let agg = TsdbAggregator::start(repo, Duration::from_secs(30));

        agg.ingest(point("m", "svc", 0, 1.0));
        agg.ingest(point("m", "svc", 45, 10.0));

        let open = agg.open.lock().unwrap();
        assert_eq!(open.len(), 2);
        let starts: Vec<i64> = open.values().map(|b| b.bucket_start.timestamp()).collect();
        assert!(starts.contains(&0));
        assert!(starts.contains(&30));
    }

    #[test]
    fn identical_attribute_sets_in_different_key_order_share_a_bucket() {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap());
        let agg = TsdbAggregator::start(repo, Duration::from_secs(30));

        let mut p1 = point("m", "svc", 0, 1.0);
        p1.attributes = serde_json::json!({"a": 1, "b": 2});
        let mut p2 = point("m", "svc", 1, 2.0);
        p2.attributes = serde_json::json!({"b": 2, "a": 1});

        agg.ingest(p1);
        agg.ingest(p2);

        let open = agg.open.lock().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open.values().next().unwrap().count, 2);
    }
}
