//! Relational schema (spec §6 "Persisted state layout"). Tables
//! `{traces, spans, logs, metric_buckets}`; indexes on `service_name`,
//! `trace_id`, `severity`, `timestamp`, plus a unique index on
//! `traces.trace_id`.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    trace_id     TEXT PRIMARY KEY,
    service_name TEXT NOT NULL,
    start_time   TEXT NOT NULL,
    duration_us  INTEGER NOT NULL,
    status       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_traces_trace_id ON traces(trace_id);
CREATE INDEX IF NOT EXISTS idx_traces_service_name ON traces(service_name);
CREATE INDEX IF NOT EXISTS idx_traces_start_time ON traces(start_time);

CREATE TABLE IF NOT EXISTS spans (
    trace_id        TEXT NOT NULL,
    span_id         TEXT NOT NULL,
    parent_span_id  TEXT NOT NULL,
    operation_name  TEXT NOT NULL,
    service_name    TEXT NOT NULL,
    start_time      TEXT NOT NULL,
    end_time        TEXT NOT NULL,
    duration_us     INTEGER NOT NULL,
    attributes      BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans(trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_service_name ON spans(service_name);

CREATE TABLE IF NOT EXISTS logs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id     TEXT,
    span_id      TEXT,
    severity     TEXT NOT NULL,
    body         BLOB NOT NULL,
    service_name TEXT NOT NULL,
    attributes   BLOB NOT NULL,
    timestamp    TEXT NOT NULL,
    insight      BLOB
);
CREATE INDEX IF NOT EXISTS idx_logs_service_name ON logs(service_name);
CREATE INDEX IF NOT EXISTS idx_logs_severity ON logs(severity);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_trace_id ON logs(trace_id);

CREATE TABLE IF NOT EXISTS metric_buckets (
    metric_name   TEXT NOT NULL,
    service_name  TEXT NOT NULL,
    bucket_start  TEXT NOT NULL,
    min_value     REAL NOT NULL,
    max_value     REAL NOT NULL,
    sum_value     REAL NOT NULL,
    count_value   INTEGER NOT NULL,
    attributes    BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_buckets_name ON metric_buckets(metric_name);
CREATE INDEX IF NOT EXISTS idx_metric_buckets_service ON metric_buckets(service_name);
CREATE INDEX IF NOT EXISTS idx_metric_buckets_start ON metric_buckets(bucket_start);
"#;
