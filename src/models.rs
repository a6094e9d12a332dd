//! Entity and view types shared across the repository, ingestor and hubs
//! (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `trace.status` is stored literally as one of these strings so that
/// "contains ERROR" substring matching (spec §4.2 dashboard stats) keeps
/// working regardless of how status is rendered elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

impl SpanStatus {
    /// Maps an OTLP `Status.code` (0=UNSET, 1=OK, 2=ERROR).
    pub fn from_otlp_code(code: i32) -> Self {
        match code {
            1 => SpanStatus::Ok,
            2 => SpanStatus::Error,
            _ => SpanStatus::Unset,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "STATUS_CODE_OK",
            SpanStatus::Error => "STATUS_CODE_ERROR",
            SpanStatus::Unset => "STATUS_CODE_UNSET",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_us: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub operation_name: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_us: i64,
    /// Compressed canonical-JSON attribute blob.
    pub attributes: Vec<u8>,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty() || self.parent_span_id == "0".repeat(16)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub id: i64,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub severity: String,
    /// Compressed log body.
    pub body: Vec<u8>,
    pub service_name: String,
    /// Compressed canonical-JSON attribute blob.
    pub attributes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Compressed AI-insight body; populated asynchronously, one-shot.
    pub insight: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBucket {
    pub metric_name: String,
    pub service_name: String,
    pub bucket_start: DateTime<Utc>,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: i64,
    /// Compressed canonical-JSON attribute-fingerprint blob.
    pub attributes: Vec<u8>,
}

/// Transient raw metric point; never persisted (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMetricPoint {
    pub metric_name: String,
    pub service_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

// ---------------------------------------------------------------------
// Filters & paginated results
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Timestamp,
    Duration,
    ServiceName,
    Status,
    TraceId,
}

impl SortField {
    /// Whitelisted sort vocabulary (spec §4.2); anything else falls back to
    /// `Timestamp` (rendered as `timestamp DESC`).
    pub fn parse(input: &str) -> SortField {
        match input {
            "duration" => SortField::Duration,
            "service_name" => SortField::ServiceName,
            "status" => SortField::Status,
            "trace_id" => SortField::TraceId,
            "timestamp" => SortField::Timestamp,
            _ => SortField::Timestamp,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            SortField::Timestamp => "start_time",
            SortField::Duration => "duration_us",
            SortField::ServiceName => "service_name",
            SortField::Status => "status",
            SortField::TraceId => "trace_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(input: &str) -> SortOrder {
        if input.eq_ignore_ascii_case("asc") {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub services: Vec<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: SortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceView {
    pub trace_id: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: String,
    pub span_count: i64,
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePage {
    pub total: i64,
    pub traces: Vec<TraceView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDetail {
    pub trace: Trace,
    pub spans: Vec<Span>,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone)]
pub struct MetricBucketFilter {
    pub metric_name: String,
    pub services: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LogFilter {
    pub service: Option<String>,
    pub severity: Option<String>,
    pub search: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub total: i64,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_traces: i64,
    pub total_logs: i64,
    pub total_errors: i64,
    pub avg_latency_ms: f64,
    pub error_rate_pct: f64,
    pub active_services: i64,
    pub p99_latency_us: i64,
    pub top_failing_services: Vec<ServiceErrorRate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorRate {
    pub service_name: String,
    pub error_rate_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPoint {
    pub timestamp: DateTime<Utc>,
    pub count: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPoint {
    pub timestamp: DateTime<Utc>,
    pub duration_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapNode {
    pub service_name: String,
    pub total_calls: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapEdge {
    pub from_service: String,
    pub to_service: String,
    pub call_count: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapMetrics {
    pub nodes: Vec<ServiceMapNode>,
    pub edges: Vec<ServiceMapEdge>,
}

/// The transient per-service live view computed by the Event Hub (spec §3,
/// §4.7). Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub service: Option<String>,
    pub dashboard: DashboardStats,
    pub traffic: Vec<TrafficPoint>,
    pub top_traces: Vec<TraceView>,
    pub service_map: ServiceMapMetrics,
}
