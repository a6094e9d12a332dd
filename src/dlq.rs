//! C3 — Dead-Letter Queue. Persists opaque byte payloads a downstream
//! writer rejected and replays them on a timer using an injected handler
//! (spec §4.3). Ordering is best-effort (filename encodes receipt order);
//! at-most-once delivery is not claimed, so handlers must be idempotent.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DlqError, RepositoryError};
use crate::models::{Log, MetricBucket, Span, Trace};
use crate::repository::Repository;
use crate::telemetry::TelemetryRegistry;

/// A batch that failed to persist, tagged so the replay handler knows which
/// repository method to retry it against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DlqPayload {
    Traces(Vec<Trace>),
    Spans(Vec<Span>),
    Logs(Vec<Log>),
    MetricBuckets(Vec<MetricBucket>),
}

/// `true` on success (item is removed), `false` on failure (left in place).
pub type ReplayHandler =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Builds the replay handler that wraps C2: deserialize the payload and
/// retry it against the repository method it originally failed on.
pub fn repository_replay_handler(repo: Arc<dyn Repository>) -> ReplayHandler {
    Arc::new(move |bytes: Vec<u8>| {
        let repo = repo.clone();
        Box::pin(async move {
            let payload: DlqPayload = match serde_json::from_slice(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "dlq: payload does not deserialize, dropping permanently");
                    return true;
                }
            };
            let result: Result<(), RepositoryError> = match payload {
                DlqPayload::Traces(items) => repo.batch_create_traces(&items).await,
                DlqPayload::Spans(items) => repo.batch_create_spans(&items).await,
                DlqPayload::Logs(items) => repo.batch_create_logs(&items).await,
                DlqPayload::MetricBuckets(items) => repo.batch_create_metric_buckets(&items).await,
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "dlq replay: handler failed, retrying later");
                    false
                }
            }
        })
    })
}

pub struct DeadLetterQueue {
    dir: PathBuf,
    seq: AtomicU64,
    stopped: AtomicBool,
    replay_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    handler: ReplayHandler,
    telemetry: Arc<TelemetryRegistry>,
}

impl DeadLetterQueue {
    pub async fn new(
        path: impl AsRef<Path>,
        replay_interval: Duration,
        handler: ReplayHandler,
        telemetry: Arc<TelemetryRegistry>,
    ) -> Result<Arc<Self>, DlqError> {
        let dir = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let queue = Arc::new(Self {
            dir,
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            replay_task: Mutex::new(None),
            handler,
            telemetry,
        });

        if let Ok(n) = queue.size().await {
            queue.telemetry.set_dlq_size(n);
        }

        let replayer = queue.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(replay_interval);
            loop {
                tick.tick().await;
                if replayer.stopped.load(Ordering::Relaxed) {
                    break;
                }
                replayer.replay_once().await;
            }
        });
        *queue.replay_task.lock().await = Some(task);

        Ok(queue)
    }

    /// Atomically writes a uniquely named file (write to a `.tmp` sibling,
    /// then rename, so a crash mid-write never leaves a half-written item
    /// for the replayer to pick up).
    pub async fn enqueue(&self, payload: &DlqPayload) -> Result<(), DlqError> {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{:020}-{:010}.item", now_nanos(), seq);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let final_path = self.dir.join(&name);
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        if let Ok(n) = self.size().await {
            self.telemetry.set_dlq_size(n);
        }
        Ok(())
    }

    pub async fn size(&self) -> Result<u64, DlqError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut count = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            if !is_tmp(&entry.path()) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn replay_once(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dlq replay: failed to list directory");
                return;
            }
        };

        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if !is_tmp(&path) {
                        files.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "dlq replay: failed to read directory entry");
                    break;
                }
            }
        }
        // Filenames are zero-padded (nanos, seq), so lexical order is
        // chronological: oldest-first.
        files.sort();

        for path in files {
            let payload = match tokio::fs::read(&path).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "dlq replay: failed to read item");
                    continue;
                }
            };
            if (self.handler)(payload).await {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(error = %e, path = %path.display(), "dlq replay: failed to remove replayed item");
                }
            }
        }

        if let Ok(n) = self.size().await {
            self.telemetry.set_dlq_size(n);
        }
    }

    /// Flushes (one final replay attempt) and halts the replayer. Safe to
    /// call more than once.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let mut guard = self.replay_task.lock().await;
        if let Some(task) = guard.take() {
            task.abort();
        }
        self.replay_once().await;
    }
}

fn is_tmp(path: &Path) -> bool {
    path.extension().map(|e| e == "tmp").unwrap_or(false)
}

fn now_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn replay_retries_until_handler_succeeds() {
        let dir = std::env::temp_dir().join(format!("argus-dlq-test-{}", now_nanos()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let handler: ReplayHandler = Arc::new(move |_payload: Vec<u8>| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                // Fail the first call, succeed on the second.
                attempts.fetch_add(1, Ordering::SeqCst) >= 1
            })
        });

        let telemetry = Arc::new(TelemetryRegistry::new());
        let dlq = DeadLetterQueue::new(&dir, Duration::from_secs(3600), handler, telemetry.clone())
            .await
            .unwrap();

        dlq.enqueue(&DlqPayload::Logs(vec![])).await.unwrap();
        assert_eq!(dlq.size().await.unwrap(), 1);

        dlq.replay_once().await;
        assert_eq!(dlq.size().await.unwrap(), 1, "first attempt should fail and retain the item");

        dlq.replay_once().await;
        assert_eq!(dlq.size().await.unwrap(), 0, "second attempt should succeed and remove the item");

        dlq.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn enqueue_creates_exactly_one_file_per_payload() {
        let dir = std::env::temp_dir().join(format!("argus-dlq-test-{}", now_nanos() + 1));
        let handler: ReplayHandler = Arc::new(|_| Box::pin(async { false }));
        let telemetry = Arc::new(TelemetryRegistry::new());
        let dlq = DeadLetterQueue::new(&dir, Duration::from_secs(3600), handler, telemetry)
            .await
            .unwrap();

        dlq.enqueue(&DlqPayload::Logs(vec![])).await.unwrap();
        dlq.enqueue(&DlqPayload::Traces(vec![])).await.unwrap();
        assert_eq!(dlq.size().await.unwrap(), 2);

        dlq.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
