//! End-to-end scenarios S1–S6 (spec.md §8), driven against the public
//! crate surface rather than any internal module.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::TraceService, ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{
    span::Event, status::StatusCode, ResourceSpans, ScopeSpans, Span as OtlpSpan, Status as OtlpStatus,
};
use tonic::Request;

use argus::dlq::{repository_replay_handler, DeadLetterQueue, DlqPayload};
use argus::error::RepositoryError;
use argus::event_hub::EventHub;
use argus::models::{Log, LogFilter, MetricBucketFilter, RawMetricPoint, SortField, SortOrder, TraceFilter};
use argus::otlp::{IngestFilterConfig, Ingestor, TraceIngestor};
use argus::repository::{Repository, SqliteRepository};
use argus::telemetry::TelemetryRegistry;
use argus::tsdb::TsdbAggregator;

fn kv_string(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(any_value::Value::StringValue(value.to_string())) }),
    }
}

fn no_op_filter() -> IngestFilterConfig {
    IngestFilterConfig {
        min_severity: argus::otlp::severity_level("DEBUG"),
        allowed_services: Default::default(),
        excluded_services: Default::default(),
    }
}

async fn in_memory_ingestor(
    telemetry: Arc<TelemetryRegistry>,
    log_callback: Arc<dyn Fn(Log) + Send + Sync>,
) -> (Arc<Ingestor>, Arc<dyn Repository>, Arc<DeadLetterQueue>, Arc<TsdbAggregator>) {
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory(telemetry.clone()).unwrap());
    let dlq_dir = std::env::temp_dir().join(format!("argus-e2e-dlq-{}", uuid::Uuid::new_v4()));
    let dlq = DeadLetterQueue::new(
        dlq_dir,
        Duration::from_secs(3600),
        repository_replay_handler(repo.clone()),
        telemetry.clone(),
    )
    .await
    .unwrap();
    let tsdb = TsdbAggregator::start(repo.clone(), argus::tsdb::DEFAULT_WINDOW);
    let ingestor = Arc::new(Ingestor {
        repo: repo.clone(),
        dlq: dlq.clone(),
        tsdb: tsdb.clone(),
        telemetry,
        filter: no_op_filter(),
        log_callback,
        metric_callback: Arc::new(|_| {}),
    });
    (ingestor, repo, dlq, tsdb)
}

#[tokio::test]
async fn s1_single_span_trace_ok_status() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let (ingestor, repo, _dlq, _tsdb) = in_memory_ingestor(telemetry, Arc::new(|_| {})).await;
    let service = TraceIngestor::new(ingestor);

    let span = OtlpSpan {
        trace_id: vec![0xAA; 16],
        span_id: vec![0xBB; 8],
        parent_span_id: vec![0x00; 8],
        name: "process_order".to_string(),
        start_time_unix_nano: 1_735_689_600_000_000_000,
        end_time_unix_nano: 1_735_689_600_500_000_000,
        status: Some(OtlpStatus { message: String::new(), code: StatusCode::Ok as i32 }),
        ..Default::default()
    };
    let rs = ResourceSpans {
        resource: Some(Resource { attributes: vec![kv_string("service.name", "order-service")], dropped_attributes_count: 0 }),
        scope_spans: vec![ScopeSpans { scope: None, spans: vec![span], schema_url: String::new() }],
        schema_url: String::new(),
    };
    let request = Request::new(ExportTraceServiceRequest { resource_spans: vec![rs] });
    service.export(request).await.expect("export should succeed");

    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
    let filter = TraceFilter {
        start,
        end,
        services: vec![],
        status: None,
        search: None,
        limit: 50,
        offset: 0,
        sort_by: SortField::Timestamp,
        order: SortOrder::Desc,
    };
    let page = repo.get_traces_filtered(filter).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.traces.len(), 1);
    let trace = &page.traces[0];
    assert_eq!(trace.trace_id, "aa".repeat(16));
    assert_eq!(trace.service_name, "order-service");
    assert_eq!(trace.duration_ms, 500.0);
    assert_eq!(trace.span_count, 1);
    assert_eq!(trace.operation, "process_order");
    assert_eq!(trace.status, "STATUS_CODE_OK");
}

#[tokio::test]
async fn s2_span_with_exception_event_synthesizes_one_error_log() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let captured: Arc<Mutex<Vec<Log>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_clone = captured.clone();
    let (ingestor, _repo, _dlq, _tsdb) =
        in_memory_ingestor(telemetry, Arc::new(move |log: Log| captured_clone.lock().unwrap().push(log))).await;
    let service = TraceIngestor::new(ingestor);

    let t0 = 1_735_689_600_000_000_000u64;
    let span = OtlpSpan {
        trace_id: vec![0xCC; 16],
        span_id: vec![0xDD; 8],
        parent_span_id: vec![],
        name: "charge_card".to_string(),
        start_time_unix_nano: t0,
        end_time_unix_nano: t0 + 100_000_000,
        events: vec![Event {
            time_unix_nano: t0,
            name: "exception".to_string(),
            attributes: vec![kv_string("exception.message", "timeout")],
            dropped_attributes_count: 0,
        }],
        status: Some(OtlpStatus { message: String::new(), code: StatusCode::Ok as i32 }),
        ..Default::default()
    };
    let rs = ResourceSpans {
        resource: Some(Resource { attributes: vec![kv_string("service.name", "payment-service")], dropped_attributes_count: 0 }),
        scope_spans: vec![ScopeSpans { scope: None, spans: vec![span], schema_url: String::new() }],
        schema_url: String::new(),
    };
    service.export(Request::new(ExportTraceServiceRequest { resource_spans: vec![rs] })).await.unwrap();

    let logs = captured.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, "ERROR");
    assert_eq!(argus::compress::decode(&logs[0].body), "timeout");
}

#[tokio::test]
async fn s3_metric_aggregation_over_tumbling_windows() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory(telemetry).unwrap());
    let agg = TsdbAggregator::start(repo.clone(), Duration::from_secs(30));

    let point = |t: i64, v: f64| RawMetricPoint {
        metric_name: "orders_processed_total".to_string(),
        service_name: "order-service".to_string(),
        value: v,
        timestamp: Utc.timestamp_opt(t, 0).unwrap(),
        attributes: serde_json::json!({}),
    };
    agg.ingest(point(0, 1.0));
    agg.ingest(point(10, 2.0));
    agg.ingest(point(20, 3.0));
    agg.ingest(point(45, 10.0));

    agg.stop().await;

    let filter = MetricBucketFilter {
        metric_name: "orders_processed_total".to_string(),
        services: vec![],
        start: Utc.timestamp_opt(0, 0).unwrap(),
        end: Utc.timestamp_opt(100, 0).unwrap(),
    };
    let mut buckets = repo.get_metric_buckets(filter).await.unwrap();
    buckets.sort_by_key(|b| b.bucket_start);
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].min, 1.0);
    assert_eq!(buckets[0].max, 3.0);
    assert_eq!(buckets[0].sum, 6.0);
    assert_eq!(buckets[0].count, 3);
    assert_eq!(buckets[1].min, 10.0);
    assert_eq!(buckets[1].max, 10.0);
    assert_eq!(buckets[1].count, 1);
}

#[tokio::test]
async fn s4_log_filter_and_pagination() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory(telemetry).unwrap());

    let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let logs: Vec<Log> = (0..100)
        .map(|i| Log {
            id: 0,
            trace_id: None,
            span_id: None,
            severity: "INFO".to_string(),
            body: argus::compress::encode(&format!("log {i}")),
            service_name: "order-service".to_string(),
            attributes: argus::compress::encode_attributes(&serde_json::json!({})),
            timestamp: base + chrono::Duration::seconds(i),
            insight: None,
        })
        .collect();
    repo.batch_create_logs(&logs).await.unwrap();

    let filter = LogFilter {
        service: None,
        severity: Some("INFO".to_string()),
        search: None,
        start: base - chrono::Duration::seconds(1),
        end: base + chrono::Duration::seconds(200),
        limit: 25,
        offset: 50,
    };
    let page = repo.get_logs_filtered(filter).await.unwrap();
    assert_eq!(page.total, 100);
    assert_eq!(page.logs.len(), 25);
    // DESC order, offset 50 -> indices 49..25 (inclusive), newest first.
    assert_eq!(page.logs[0].timestamp, base + chrono::Duration::seconds(49));
    assert_eq!(page.logs[24].timestamp, base + chrono::Duration::seconds(25));
}

struct FlakyOnceRepository {
    inner: SqliteRepository,
    fail_next: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl Repository for FlakyOnceRepository {
    async fn batch_create_traces(&self, traces: &[argus::models::Trace]) -> Result<(), RepositoryError> {
        self.inner.batch_create_traces(traces).await
    }
    async fn batch_create_spans(&self, spans: &[argus::models::Span]) -> Result<(), RepositoryError> {
        self.inner.batch_create_spans(spans).await
    }
    async fn batch_create_logs(&self, logs: &[Log]) -> Result<(), RepositoryError> {
        if self.fail_next.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(RepositoryError::TransientIo("storage unavailable".to_string()));
        }
        self.inner.batch_create_logs(logs).await
    }
    async fn batch_create_metric_buckets(&self, buckets: &[argus::models::MetricBucket]) -> Result<(), RepositoryError> {
        self.inner.batch_create_metric_buckets(buckets).await
    }
    async fn get_metric_buckets(&self, filter: MetricBucketFilter) -> Result<Vec<argus::models::MetricBucket>, RepositoryError> {
        self.inner.get_metric_buckets(filter).await
    }
    async fn get_log(&self, id: i64) -> Result<Log, RepositoryError> {
        self.inner.get_log(id).await
    }
    async fn update_log_insight(&self, id: i64, text: &str) -> Result<(), RepositoryError> {
        self.inner.update_log_insight(id, text).await
    }
    async fn get_trace(&self, trace_id: &str) -> Result<argus::models::TraceDetail, RepositoryError> {
        self.inner.get_trace(trace_id).await
    }
    async fn get_traces_filtered(&self, filter: TraceFilter) -> Result<argus::models::TracePage, RepositoryError> {
        self.inner.get_traces_filtered(filter).await
    }
    async fn get_logs_filtered(&self, filter: LogFilter) -> Result<argus::models::LogPage, RepositoryError> {
        self.inner.get_logs_filtered(filter).await
    }
    async fn get_log_context(&self, t: chrono::DateTime<Utc>) -> Result<Vec<Log>, RepositoryError> {
        self.inner.get_log_context(t).await
    }
    async fn get_dashboard_stats(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        services: &[String],
    ) -> Result<argus::models::DashboardStats, RepositoryError> {
        self.inner.get_dashboard_stats(start, end, services).await
    }
    async fn get_traffic_metrics(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        services: &[String],
    ) -> Result<Vec<argus::models::TrafficPoint>, RepositoryError> {
        self.inner.get_traffic_metrics(start, end, services).await
    }
    async fn get_latency_heatmap(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        services: &[String],
    ) -> Result<Vec<argus::models::LatencyPoint>, RepositoryError> {
        self.inner.get_latency_heatmap(start, end, services).await
    }
    async fn get_service_map_metrics(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<argus::models::ServiceMapMetrics, RepositoryError> {
        self.inner.get_service_map_metrics(start, end).await
    }
    async fn purge_logs(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.inner.purge_logs(cutoff).await
    }
    async fn purge_traces(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.inner.purge_traces(cutoff).await
    }
    async fn vacuum(&self) -> Result<(), RepositoryError> {
        self.inner.vacuum().await
    }
    async fn get_services(&self) -> Result<Vec<String>, RepositoryError> {
        self.inner.get_services().await
    }
    async fn get_metric_names(&self, service: Option<&str>) -> Result<Vec<String>, RepositoryError> {
        self.inner.get_metric_names(service).await
    }
}

#[tokio::test]
async fn s5_dlq_replay_recovers_once_storage_is_healthy() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let flaky = Arc::new(FlakyOnceRepository {
        inner: SqliteRepository::open_in_memory(telemetry.clone()).unwrap(),
        fail_next: std::sync::atomic::AtomicUsize::new(1),
    });
    let repo: Arc<dyn Repository> = flaky.clone();

    let dlq_dir = std::env::temp_dir().join(format!("argus-e2e-dlq-s5-{}", uuid::Uuid::new_v4()));
    let dlq = DeadLetterQueue::new(
        dlq_dir,
        Duration::from_millis(20),
        repository_replay_handler(repo.clone()),
        telemetry.clone(),
    )
    .await
    .unwrap();

    let log = Log {
        id: 0,
        trace_id: None,
        span_id: None,
        severity: "ERROR".to_string(),
        body: argus::compress::encode("db write failed"),
        service_name: "order-service".to_string(),
        attributes: argus::compress::encode_attributes(&serde_json::json!({})),
        timestamp: Utc::now(),
        insight: None,
    };
    dlq.enqueue(&DlqPayload::Logs(vec![log])).await.unwrap();
    assert_eq!(dlq.size().await.unwrap(), 1);

    let mut recovered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if dlq.size().await.unwrap() == 0 {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "dlq did not drain after storage recovered");
    assert_eq!(telemetry.get_health_snapshot().dlq_size, 0);

    dlq.stop().await;
}

#[tokio::test]
async fn s6_event_hub_groups_clients_by_service_filter() {
    let telemetry = Arc::new(TelemetryRegistry::new());
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory(telemetry.clone()).unwrap());
    let hub = EventHub::start(repo, telemetry);

    let (_id_a, mut rx_a) = hub.register_client("order-service".to_string());
    let (_id_b, mut rx_b) = hub.register_client(String::new());

    // Drain the immediate on-connect-equivalent refresh triggered by registration.
    let _ = tokio::time::timeout(Duration::from_millis(200), rx_a.recv()).await;
    let _ = tokio::time::timeout(Duration::from_millis(200), rx_b.recv()).await;

    hub.ingest_log(Log {
        id: 0,
        trace_id: None,
        span_id: None,
        severity: "INFO".to_string(),
        body: argus::compress::encode("hello"),
        service_name: "order-service".to_string(),
        attributes: argus::compress::encode_attributes(&serde_json::json!({})),
        timestamp: Utc::now(),
        insight: None,
    });

    let a_msg = tokio::time::timeout(Duration::from_secs(10), rx_a.recv()).await;
    let b_msg = tokio::time::timeout(Duration::from_secs(10), rx_b.recv()).await;
    assert!(a_msg.is_ok() && a_msg.unwrap().is_some(), "client A should receive a snapshot");
    assert!(b_msg.is_ok() && b_msg.unwrap().is_some(), "client B should receive a snapshot");

    hub.stop().await;
}
