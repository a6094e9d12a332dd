//! AI enrichment worker contract (spec §1 "out of scope"): a channel of
//! [`Log`] consumed by a worker that writes an `insight` field back via
//! `Repository::update_log_insight`. The worker itself is an external
//! collaborator; this crate ships only the channel contract and a no-op
//! sink that drains the queue without ever producing an insight, so the
//! ingestion path has somewhere to submit to regardless of `AI_ENABLED`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

use crate::models::Log;

const QUEUE_CAPACITY: usize = 1000;

pub struct AiWorker {
    tx: Mutex<Option<mpsc::Sender<Log>>>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AiWorker {
    /// When `enabled` is false the worker is still constructed so callers
    /// have a uniform `submit` target, but no channel or task is created;
    /// `submit` becomes a guaranteed no-op.
    pub fn start(enabled: bool) -> Arc<Self> {
        if !enabled {
            return Arc::new(Self { tx: Mutex::new(None), stopped: Arc::new(AtomicBool::new(true)), task: Mutex::new(None) });
        }

        let (tx, mut rx) = mpsc::channel::<Log>(QUEUE_CAPACITY);
        let worker = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            stopped: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(async move {
            // No-op sink: an external enrichment process is the real
            // consumer of this contract (spec §1); this drains the queue
            // so submitters never block, and never writes an insight.
            while rx.recv().await.is_some() {}
        });
        *worker.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        worker
    }

    /// Non-blocking; an overloaded AI queue drops the submission and logs
    /// it (spec §7 "overload").
    pub fn submit(&self, log: Log) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(log).is_err() {
                warn!("ai worker: queue full or closed, dropping submission");
            }
        }
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_log() -> Log {
        Log {
            id: 0,
            trace_id: None,
            span_id: None,
            severity: "ERROR".to_string(),
            body: crate::compress::encode("boom"),
            service_name: "svc".to_string(),
            attributes: crate::compress::encode_attributes(&serde_json::json!({})),
            timestamp: Utc::now(),
            insight: None,
        }
    }

    #[tokio::test]
    async fn disabled_worker_never_blocks_submit() {
        let worker = AiWorker::start(false);
        worker.submit(sample_log());
        worker.stop().await;
    }

    #[tokio::test]
    async fn enabled_worker_drains_without_panicking() {
        let worker = AiWorker::start(true);
        for _ in 0..10 {
            worker.submit(sample_log());
        }
        worker.stop().await;
    }
}
