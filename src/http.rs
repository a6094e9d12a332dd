//! REST surface (spec §6). Thin `axum` handlers over the [`Repository`]
//! trait and [`TelemetryRegistry`] — no business logic of its own, per
//! spec §1's "out of scope: HTTP REST handlers ... thin adapters over the
//! repository."
//!
//! Query strings may repeat `service_name`, which `serde_urlencoded` (what
//! `axum::extract::Query` uses) cannot aggregate into a `Vec`, so these
//! handlers take the raw query string and parse it by hand instead of
//! pulling in a second query-string crate alongside it.

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::compress;
use crate::error::RepositoryError;
use crate::models::*;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/metadata/services", get(get_services))
        .route("/api/metadata/metrics", get(get_metric_names))
        .route("/api/metrics", get(get_metric_buckets))
        .route("/api/metrics/traffic", get(get_traffic))
        .route("/api/metrics/latency_heatmap", get(get_latency_heatmap))
        .route("/api/metrics/dashboard", get(get_dashboard))
        .route("/api/metrics/service-map", get(get_service_map))
        .route("/api/traces", get(get_traces))
        .route("/api/traces/{id}", get(get_trace))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/context", get(get_log_context))
        .route("/api/logs/{id}/insight", get(get_log_insight))
        .route("/api/stats", get(get_dashboard))
        .route("/api/health", get(get_health))
        .route("/metrics", get(get_prometheus_text))
        .route("/api/admin/purge", delete(purge))
        .route("/api/admin/vacuum", post(vacuum))
}

// ---------------------------------------------------------------------
// Query-string parsing (no repeated-key support in `axum::extract::Query`)
// ---------------------------------------------------------------------

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn parse(raw: Option<String>) -> Self {
        let pairs = raw
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let mut it = pair.splitn(2, '=');
                let k = percent_decode(it.next().unwrap_or(""));
                let v = percent_decode(it.next().unwrap_or(""));
                (k, v)
            })
            .collect();
        Self(pairs)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn get_all(&self, key: &str) -> Vec<String> {
        self.0.iter().filter(|(k, _)| k == key).map(|(_, v)| v.clone()).collect()
    }

    fn start_end(&self, default_window: ChronoDuration) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self
            .get("end")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let start = self
            .get("start")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(end - default_window);
        (start, end)
    }

    fn limit(&self, default: i64) -> i64 {
        self.get("limit").and_then(|s| s.parse().ok()).unwrap_or(default)
    }

    fn offset(&self) -> i64 {
        self.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------
// Error mapping (spec §7: validation→4xx, not_found→404, else 500)
// ---------------------------------------------------------------------

fn error_response(e: RepositoryError) -> Response {
    let status = match &e {
        RepositoryError::NotFound(_) => StatusCode::NOT_FOUND,
        RepositoryError::Validation(_) => StatusCode::BAD_REQUEST,
        RepositoryError::ConstraintViolation(_) => StatusCode::CONFLICT,
        RepositoryError::TransientIo(_) | RepositoryError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

// ---------------------------------------------------------------------
// JSON view types: decode the compressed columns before serializing, the
// way `hub.rs`'s `BroadcastLog`/`BroadcastMetric` already do for the WS
// surfaces.
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct LogView {
    id: i64,
    trace_id: Option<String>,
    span_id: Option<String>,
    severity: String,
    body: String,
    service_name: String,
    attributes: serde_json::Value,
    timestamp: DateTime<Utc>,
    insight: Option<String>,
}

impl From<Log> for LogView {
    fn from(l: Log) -> Self {
        Self {
            id: l.id,
            trace_id: l.trace_id,
            span_id: l.span_id,
            severity: l.severity,
            body: compress::decode(&l.body),
            service_name: l.service_name,
            attributes: serde_json::from_str(&compress::decode(&l.attributes)).unwrap_or(serde_json::Value::Null),
            timestamp: l.timestamp,
            insight: l.insight.map(|b| compress::decode(&b)),
        }
    }
}

#[derive(Serialize)]
struct SpanView {
    trace_id: String,
    span_id: String,
    parent_span_id: String,
    operation_name: String,
    service_name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_us: i64,
    attributes: serde_json::Value,
}

impl From<Span> for SpanView {
    fn from(s: Span) -> Self {
        Self {
            trace_id: s.trace_id,
            span_id: s.span_id,
            parent_span_id: s.parent_span_id,
            operation_name: s.operation_name,
            service_name: s.service_name,
            start_time: s.start_time,
            end_time: s.end_time,
            duration_us: s.duration_us,
            attributes: serde_json::from_str(&compress::decode(&s.attributes)).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Serialize)]
struct TraceDetailView {
    trace: Trace,
    spans: Vec<SpanView>,
    logs: Vec<LogView>,
}

impl From<TraceDetail> for TraceDetailView {
    fn from(d: TraceDetail) -> Self {
        Self {
            trace: d.trace,
            spans: d.spans.into_iter().map(SpanView::from).collect(),
            logs: d.logs.into_iter().map(LogView::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct MetricBucketView {
    metric_name: String,
    service_name: String,
    bucket_start: DateTime<Utc>,
    min: f64,
    max: f64,
    sum: f64,
    count: i64,
    attributes: serde_json::Value,
}

impl From<MetricBucket> for MetricBucketView {
    fn from(b: MetricBucket) -> Self {
        Self {
            metric_name: b.metric_name,
            service_name: b.service_name,
            bucket_start: b.bucket_start,
            min: b.min,
            max: b.max,
            sum: b.sum,
            count: b.count,
            attributes: serde_json::from_str(&compress::decode(&b.attributes)).unwrap_or(serde_json::Value::Null),
        }
    }
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

async fn get_services(State(state): State<AppState>) -> Response {
    match state.repo.get_services().await {
        Ok(services) => Json(services).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_metric_names(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    match state.repo.get_metric_names(q.get("service_name")).await {
        Ok(names) => Json(names).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_metric_buckets(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let Some(name) = q.get("name") else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing required query parameter `name`" })))
            .into_response();
    };
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    let filter = MetricBucketFilter {
        metric_name: name.to_string(),
        services: q.get_all("service_name"),
        start,
        end,
    };
    match state.repo.get_metric_buckets(filter).await {
        Ok(buckets) => Json(buckets.into_iter().map(MetricBucketView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_traffic(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    let services = q.get_all("service_name");
    match state.repo.get_traffic_metrics(start, end, &services).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_latency_heatmap(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    let services = q.get_all("service_name");
    match state.repo.get_latency_heatmap(start, end, &services).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_dashboard(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(24));
    let services = q.get_all("service_name");
    match state.repo.get_dashboard_stats(start, end, &services).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_service_map(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    match state.repo.get_service_map_metrics(start, end).await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_traces(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    let filter = TraceFilter {
        start,
        end,
        services: q.get_all("service_name"),
        status: q.get("status").map(str::to_string),
        search: q.get("search").map(str::to_string),
        limit: q.limit(50),
        offset: q.offset(),
        sort_by: SortField::parse(q.get("sort_by").unwrap_or("timestamp")),
        order: SortOrder::parse(q.get("order").unwrap_or("desc")),
    };
    match state.repo.get_traces_filtered(filter).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_trace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.repo.get_trace(&id).await {
        Ok(detail) => Json(TraceDetailView::from(detail)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_logs(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let (start, end) = q.start_end(ChronoDuration::hours(1));
    let filter = LogFilter {
        service: q.get("service_name").map(str::to_string),
        severity: q.get("severity").map(str::to_string),
        search: q.get("search").map(str::to_string),
        start,
        end,
        limit: q.limit(50),
        offset: q.offset(),
    };
    match state.repo.get_logs_filtered(filter).await {
        Ok(page) => Json(json!({
            "total": page.total,
            "logs": page.logs.into_iter().map(LogView::from).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_log_context(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let Some(ts) = q.get("timestamp").and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing or invalid `timestamp` query parameter" })),
        )
            .into_response();
    };
    match state.repo.get_log_context(ts.with_timezone(&Utc)).await {
        Ok(logs) => Json(logs.into_iter().map(LogView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_log_insight(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.repo.get_log(id).await {
        Ok(log) => Json(json!({ "insight": log.insight.map(|b| compress::decode(&b)) })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_health(State(state): State<AppState>) -> Response {
    Json(state.telemetry.get_health_snapshot()).into_response()
}

async fn get_prometheus_text(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry.render_prometheus_text(),
    )
        .into_response()
}

async fn purge(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let q = QueryParams::parse(raw);
    let days: i64 = q.get("days").and_then(|s| s.parse().ok()).unwrap_or(7);
    let cutoff = Utc::now() - ChronoDuration::days(days);
    let logs_result = state.repo.purge_logs(cutoff).await;
    let traces_result = state.repo.purge_traces(cutoff).await;
    match (logs_result, traces_result) {
        (Ok(logs_deleted), Ok(traces_deleted)) => {
            Json(json!({ "logs_deleted": logs_deleted, "traces_deleted": traces_deleted })).into_response()
        }
        (Err(e), _) | (_, Err(e)) => error_response(e),
    }
}

async fn vacuum(State(state): State<AppState>) -> Response {
    match state.repo.vacuum().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => error_response(e),
    }
}
