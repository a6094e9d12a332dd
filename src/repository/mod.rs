//! C2 — Repository. Typed entity CRUD, batched inserts, filtered queries,
//! purges; zstd-compressed columns (spec §4.2).

mod schema;
pub mod sqlite;

pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::models::*;

/// Storage is pluggable (spec §1 non-goal: "the relational storage driver
/// choice"); the core only assumes transactional batch inserts and simple
/// SELECTs. This crate ships one concrete implementation,
/// [`SqliteRepository`]; a MySQL/SQL Server driver would implement the same
/// trait and differ only in its conflict-handling SQL (spec §9).
#[async_trait]
pub trait Repository: Send + Sync {
    async fn batch_create_traces(&self, traces: &[Trace]) -> Result<(), RepositoryError>;
    async fn batch_create_spans(&self, spans: &[Span]) -> Result<(), RepositoryError>;
    async fn batch_create_logs(&self, logs: &[Log]) -> Result<(), RepositoryError>;
    async fn batch_create_metric_buckets(
        &self,
        buckets: &[MetricBucket],
    ) -> Result<(), RepositoryError>;

    /// Sealed buckets for one metric, oldest-first (spec §6 `GET /api/metrics`,
    /// which requires a `name`).
    async fn get_metric_buckets(&self, filter: MetricBucketFilter) -> Result<Vec<MetricBucket>, RepositoryError>;

    async fn get_log(&self, id: i64) -> Result<Log, RepositoryError>;
    async fn update_log_insight(&self, id: i64, text: &str) -> Result<(), RepositoryError>;

    async fn get_trace(&self, trace_id: &str) -> Result<TraceDetail, RepositoryError>;
    async fn get_traces_filtered(&self, filter: TraceFilter) -> Result<TracePage, RepositoryError>;
    async fn get_logs_filtered(&self, filter: LogFilter) -> Result<LogPage, RepositoryError>;
    async fn get_log_context(&self, t: chrono::DateTime<chrono::Utc>) -> Result<Vec<Log>, RepositoryError>;

    async fn get_dashboard_stats(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        services: &[String],
    ) -> Result<DashboardStats, RepositoryError>;

    async fn get_traffic_metrics(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        services: &[String],
    ) -> Result<Vec<TrafficPoint>, RepositoryError>;

    async fn get_latency_heatmap(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        services: &[String],
    ) -> Result<Vec<LatencyPoint>, RepositoryError>;

    async fn get_service_map_metrics(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<ServiceMapMetrics, RepositoryError>;

    async fn purge_logs(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64, RepositoryError>;
    async fn purge_traces(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64, RepositoryError>;

    async fn vacuum(&self) -> Result<(), RepositoryError>;

    async fn get_services(&self) -> Result<Vec<String>, RepositoryError>;
    async fn get_metric_names(&self, service: Option<&str>) -> Result<Vec<String>, RepositoryError>;
}

/// Batch size at the storage layer (spec §4.2: "Batches of 500").
pub const STORAGE_BATCH_SIZE: usize = 500;
