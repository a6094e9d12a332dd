//! SQLite-backed [`Repository`] implementation. `rusqlite` is synchronous,
//! so every operation runs inside `spawn_blocking` — matching spec §5's
//! model where DB calls are blocking points no async task may hold a lock
//! across.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::schema::SCHEMA_SQL;
use super::{Repository, STORAGE_BATCH_SIZE};
use crate::compress;
use crate::error::RepositoryError;
use crate::models::*;
use crate::telemetry::TelemetryRegistry;

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
    telemetry: Arc<TelemetryRegistry>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>, telemetry: Arc<TelemetryRegistry>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            telemetry,
        })
    }

    pub fn open_in_memory(telemetry: Arc<TelemetryRegistry>) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            telemetry,
        })
    }

    /// Runs a blocking DB closure off the async runtime, observing its
    /// latency into C1 regardless of outcome (spec §4.2: "every call emits
    /// a latency observation").
    async fn with_conn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let telemetry = self.telemetry.clone();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| RepositoryError::TransientIo(format!("blocking task panicked: {e}")))?;
        telemetry.observe_db_latency(start.elapsed().as_secs_f64());
        result
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn services_clause(column: &str, services: &[String], params: &mut Vec<Box<dyn rusqlite::ToSql>>) -> String {
    if services.is_empty() {
        String::new()
    } else {
        let placeholders: Vec<String> = services
            .iter()
            .map(|s| {
                params.push(Box::new(s.clone()));
                "?".to_string()
            })
            .collect();
        format!(" AND {column} IN ({})", placeholders.join(","))
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn batch_create_traces(&self, traces: &[Trace]) -> Result<(), RepositoryError> {
        let traces = traces.to_vec();
        self.with_conn(move |conn| {
            for chunk in traces.chunks(STORAGE_BATCH_SIZE) {
                let tx = conn.unchecked_transaction().map_err(RepositoryError::from)?;
                for t in chunk {
                    // insert-ignore-on-conflict(trace_id): first-seen values win.
                    tx.execute(
                        "INSERT INTO traces (trace_id, service_name, start_time, duration_us, status)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(trace_id) DO NOTHING",
                        params![
                            t.trace_id,
                            t.service_name,
                            fmt_ts(t.start_time),
                            t.duration_us,
                            t.status
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                }
                tx.commit().map_err(RepositoryError::from)?;
            }
            Ok(())
        })
        .await
    }

    async fn batch_create_spans(&self, spans: &[Span]) -> Result<(), RepositoryError> {
        let spans = spans.to_vec();
        self.with_conn(move |conn| {
            for chunk in spans.chunks(STORAGE_BATCH_SIZE) {
                let tx = conn.unchecked_transaction().map_err(RepositoryError::from)?;
                for s in chunk {
                    tx.execute(
                        "INSERT INTO spans (trace_id, span_id, parent_span_id, operation_name,
                                             service_name, start_time, end_time, duration_us, attributes)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            s.trace_id,
                            s.span_id,
                            s.parent_span_id,
                            s.operation_name,
                            s.service_name,
                            fmt_ts(s.start_time),
                            fmt_ts(s.end_time),
                            s.duration_us,
                            s.attributes
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                }
                tx.commit().map_err(RepositoryError::from)?;
            }
            Ok(())
        })
        .await
    }

    async fn batch_create_logs(&self, logs: &[Log]) -> Result<(), RepositoryError> {
        let logs = logs.to_vec();
        self.with_conn(move |conn| {
            for chunk in logs.chunks(STORAGE_BATCH_SIZE) {
                let tx = conn.unchecked_transaction().map_err(RepositoryError::from)?;
                for l in chunk {
                    tx.execute(
                        "INSERT INTO logs (trace_id, span_id, severity, body, service_name,
                                            attributes, timestamp, insight)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            l.trace_id,
                            l.span_id,
                            l.severity,
                            l.body,
                            l.service_name,
                            l.attributes,
                            fmt_ts(l.timestamp),
                            l.insight
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                }
                tx.commit().map_err(RepositoryError::from)?;
            }
            Ok(())
        })
        .await
    }

    async fn batch_create_metric_buckets(&self, buckets: &[MetricBucket]) -> Result<(), RepositoryError> {
        let buckets = buckets.to_vec();
        self.with_conn(move |conn| {
            for chunk in buckets.chunks(STORAGE_BATCH_SIZE) {
                let tx = conn.unchecked_transaction().map_err(RepositoryError::from)?;
                for b in chunk {
                    tx.execute(
                        "INSERT INTO metric_buckets (metric_name, service_name, bucket_start,
                                                       min_value, max_value, sum_value, count_value, attributes)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            b.metric_name,
                            b.service_name,
                            fmt_ts(b.bucket_start),
                            b.min,
                            b.max,
                            b.sum,
                            b.count,
                            b.attributes
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                }
                tx.commit().map_err(RepositoryError::from)?;
            }
            Ok(())
        })
        .await
    }

    async fn get_metric_buckets(&self, filter: MetricBucketFilter) -> Result<Vec<MetricBucket>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut extra: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            let services_sql = services_clause("service_name", &filter.services, &mut extra);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(filter.metric_name.clone()),
                Box::new(fmt_ts(filter.start)),
                Box::new(fmt_ts(filter.end)),
            ];
            params_vec.extend(extra);

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT metric_name, service_name, bucket_start, min_value, max_value,
                            sum_value, count_value, attributes
                     FROM metric_buckets
                     WHERE metric_name = ?1 AND bucket_start >= ?2 AND bucket_start <= ?3{services_sql}
                     ORDER BY bucket_start ASC"
                ))
                .map_err(RepositoryError::from)?;
            let buckets = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |row| {
                    Ok(MetricBucket {
                        metric_name: row.get(0)?,
                        service_name: row.get(1)?,
                        bucket_start: parse_ts(&row.get::<_, String>(2)?),
                        min: row.get(3)?,
                        max: row.get(4)?,
                        sum: row.get(5)?,
                        count: row.get(6)?,
                        attributes: row.get(7)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;
            Ok(buckets)
        })
        .await
    }

    async fn get_log(&self, id: i64) -> Result<Log, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, trace_id, span_id, severity, body, service_name, attributes, timestamp, insight
                 FROM logs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Log {
                        id: row.get(0)?,
                        trace_id: row.get(1)?,
                        span_id: row.get(2)?,
                        severity: row.get(3)?,
                        body: row.get(4)?,
                        service_name: row.get(5)?,
                        attributes: row.get(6)?,
                        timestamp: parse_ts(&row.get::<_, String>(7)?),
                        insight: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(RepositoryError::from)?
            .ok_or_else(|| RepositoryError::NotFound(format!("log {id}")))
        })
        .await
    }

    async fn update_log_insight(&self, id: i64, text: &str) -> Result<(), RepositoryError> {
        let compressed = compress::encode(text);
        self.with_conn(move |conn| {
            let existing: Option<Vec<u8>> = conn
                .query_row("SELECT insight FROM logs WHERE id = ?1", params![id], |r| r.get(0))
                .optional()
                .map_err(RepositoryError::from)?
                .ok_or_else(|| RepositoryError::NotFound(format!("log {id}")))?;
            // One-shot: a second enrichment is intentionally dropped (SPEC_FULL.md §D.3).
            if existing.is_some() {
                return Err(RepositoryError::ConstraintViolation(
                    "insight already set".into(),
                ));
            }
            conn.execute(
                "UPDATE logs SET insight = ?1 WHERE id = ?2",
                params![compressed, id],
            )
            .map_err(RepositoryError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_trace(&self, trace_id: &str) -> Result<TraceDetail, RepositoryError> {
        let trace_id = trace_id.to_string();
        self.with_conn(move |conn| {
            let trace = conn
                .query_row(
                    "SELECT trace_id, service_name, start_time, duration_us, status FROM traces WHERE trace_id = ?1",
                    params![trace_id],
                    |row| {
                        Ok(Trace {
                            trace_id: row.get(0)?,
                            service_name: row.get(1)?,
                            start_time: parse_ts(&row.get::<_, String>(2)?),
                            duration_us: row.get(3)?,
                            status: row.get(4)?,
                        })
                    },
                )
                .optional()
                .map_err(RepositoryError::from)?
                .ok_or_else(|| RepositoryError::NotFound(format!("trace {trace_id}")))?;

            let mut stmt = conn
                .prepare(
                    "SELECT trace_id, span_id, parent_span_id, operation_name, service_name,
                            start_time, end_time, duration_us, attributes
                     FROM spans WHERE trace_id = ?1",
                )
                .map_err(RepositoryError::from)?;
            let spans = stmt
                .query_map(params![trace_id], |row| {
                    Ok(Span {
                        trace_id: row.get(0)?,
                        span_id: row.get(1)?,
                        parent_span_id: row.get(2)?,
                        operation_name: row.get(3)?,
                        service_name: row.get(4)?,
                        start_time: parse_ts(&row.get::<_, String>(5)?),
                        end_time: parse_ts(&row.get::<_, String>(6)?),
                        duration_us: row.get(7)?,
                        attributes: row.get(8)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, trace_id, span_id, severity, body, service_name, attributes, timestamp, insight
                     FROM logs WHERE trace_id = ?1 ORDER BY timestamp ASC",
                )
                .map_err(RepositoryError::from)?;
            let logs = stmt
                .query_map(params![trace_id], |row| {
                    Ok(Log {
                        id: row.get(0)?,
                        trace_id: row.get(1)?,
                        span_id: row.get(2)?,
                        severity: row.get(3)?,
                        body: row.get(4)?,
                        service_name: row.get(5)?,
                        attributes: row.get(6)?,
                        timestamp: parse_ts(&row.get::<_, String>(7)?),
                        insight: row.get(8)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            Ok(TraceDetail { trace, spans, logs })
        })
        .await
    }

    async fn get_traces_filtered(&self, filter: TraceFilter) -> Result<TracePage, RepositoryError> {
        self.with_conn(move |conn| {
            let mut extra_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            let services_sql = services_clause("service_name", &filter.services, &mut extra_params);

            let mut where_sql = String::from("WHERE start_time >= ?1 AND start_time <= ?2");
            where_sql.push_str(&services_sql);
            let mut base_params: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(filter.start)), Box::new(fmt_ts(filter.end))];
            base_params.extend(extra_params);

            if let Some(status) = &filter.status {
                where_sql.push_str(" AND status = ?");
                base_params.push(Box::new(status.clone()));
            }
            if let Some(search) = &filter.search {
                where_sql.push_str(" AND (trace_id LIKE ? OR service_name LIKE ?)");
                let pattern = format!("%{search}%");
                base_params.push(Box::new(pattern.clone()));
                base_params.push(Box::new(pattern));
            }

            let count_sql = format!("SELECT COUNT(*) FROM traces {where_sql}");
            let total: i64 = conn
                .query_row(&count_sql, params_from_iter(base_params.iter().map(|b| b.as_ref())), |r| r.get(0))
                .map_err(RepositoryError::from)?;

            let order_sql = format!(
                "ORDER BY {} {}",
                filter.sort_by.column(),
                filter.order.as_sql()
            );
            let page_sql = format!(
                "SELECT trace_id, service_name, start_time, duration_us, status
                 FROM traces {where_sql} {order_sql} LIMIT ? OFFSET ?"
            );
            let mut page_params = base_params;
            page_params.push(Box::new(filter.limit));
            page_params.push(Box::new(filter.offset));

            let mut stmt = conn.prepare(&page_sql).map_err(RepositoryError::from)?;
            let rows = stmt
                .query_map(params_from_iter(page_params.iter().map(|b| b.as_ref())), |row| {
                    let trace_id: String = row.get(0)?;
                    let duration_us: i64 = row.get(3)?;
                    Ok((trace_id, row.get::<_, String>(1)?, row.get::<_, String>(2)?, duration_us, row.get::<_, String>(4)?))
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            let mut traces = Vec::with_capacity(rows.len());
            for (trace_id, service_name, start_time, duration_us, status) in rows {
                let span_count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM spans WHERE trace_id = ?1",
                        params![trace_id],
                        |r| r.get(0),
                    )
                    .unwrap_or(0);
                let operation: String = conn
                    .query_row(
                        "SELECT operation_name FROM spans WHERE trace_id = ?1 AND
                         (parent_span_id = '' OR parent_span_id = '0000000000000000')
                         ORDER BY start_time ASC LIMIT 1",
                        params![trace_id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(RepositoryError::from)?
                    .unwrap_or_default();

                traces.push(TraceView {
                    trace_id,
                    service_name,
                    start_time: parse_ts(&start_time),
                    duration_ms: duration_us as f64 / 1000.0,
                    status,
                    span_count,
                    operation,
                });
            }

            Ok(TracePage { total, traces })
        })
        .await
    }

    async fn get_logs_filtered(&self, filter: LogFilter) -> Result<LogPage, RepositoryError> {
        self.with_conn(move |conn| {
            let mut where_sql = String::from("WHERE timestamp >= ?1 AND timestamp <= ?2");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(filter.start)), Box::new(fmt_ts(filter.end))];

            if let Some(service) = &filter.service {
                where_sql.push_str(" AND service_name = ?");
                params_vec.push(Box::new(service.clone()));
            }
            if let Some(severity) = &filter.severity {
                where_sql.push_str(" AND severity = ?");
                params_vec.push(Box::new(severity.clone()));
            }

            let select_sql = format!(
                "SELECT id, trace_id, span_id, severity, body, service_name, attributes, timestamp, insight
                 FROM logs {where_sql} ORDER BY timestamp DESC"
            );
            let mut stmt = conn.prepare(&select_sql).map_err(RepositoryError::from)?;
            let rows = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |row| {
                    Ok(Log {
                        id: row.get(0)?,
                        trace_id: row.get(1)?,
                        span_id: row.get(2)?,
                        severity: row.get(3)?,
                        body: row.get(4)?,
                        service_name: row.get(5)?,
                        attributes: row.get(6)?,
                        timestamp: parse_ts(&row.get::<_, String>(7)?),
                        insight: row.get(8)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            // `body` is stored compressed (spec §4.2), so a substring search over
            // it cannot be pushed down as SQL `LIKE`; decode in-app instead. The
            // time window already bounds how many rows this scans (spec §1
            // non-goal: no high-cardinality push-down query).
            let matched: Vec<Log> = match &filter.search {
                Some(search) => {
                    let needle = search.to_lowercase();
                    rows.into_iter()
                        .filter(|l| {
                            let trace_hit = l
                                .trace_id
                                .as_deref()
                                .is_some_and(|t| t.to_lowercase().contains(&needle));
                            trace_hit || compress::decode(&l.body).to_lowercase().contains(&needle)
                        })
                        .collect()
                }
                None => rows,
            };

            let total = matched.len() as i64;
            let offset = filter.offset.max(0) as usize;
            let limit = filter.limit.max(0) as usize;
            let logs = matched.into_iter().skip(offset).take(limit).collect();

            Ok(LogPage { total, logs })
        })
        .await
    }

    async fn get_log_context(&self, t: DateTime<Utc>) -> Result<Vec<Log>, RepositoryError> {
        let start = fmt_ts(t - chrono::Duration::seconds(60));
        let end = fmt_ts(t + chrono::Duration::seconds(60));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, trace_id, span_id, severity, body, service_name, attributes, timestamp, insight
                     FROM logs WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
                )
                .map_err(RepositoryError::from)?;
            let logs = stmt
                .query_map(params![start, end], |row| {
                    Ok(Log {
                        id: row.get(0)?,
                        trace_id: row.get(1)?,
                        span_id: row.get(2)?,
                        severity: row.get(3)?,
                        body: row.get(4)?,
                        service_name: row.get(5)?,
                        attributes: row.get(6)?,
                        timestamp: parse_ts(&row.get::<_, String>(7)?),
                        insight: row.get(8)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;
            Ok(logs)
        })
        .await
    }

    async fn get_dashboard_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> Result<DashboardStats, RepositoryError> {
        let services = services.to_vec();
        self.with_conn(move |conn| {
            let mut extra: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            let services_sql = services_clause("service_name", &services, &mut extra);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(start)), Box::new(fmt_ts(end))];
            params_vec.extend(extra);

            let total_traces: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM traces WHERE start_time >= ?1 AND start_time <= ?2{services_sql}"
                    ),
                    params_from_iter(params_vec.iter().map(|b| b.as_ref())),
                    |r| r.get(0),
                )
                .map_err(RepositoryError::from)?;

            let total_logs: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM logs WHERE timestamp >= ?1 AND timestamp <= ?2{}",
                        services_clause("service_name", &services, &mut Vec::new())
                    ),
                    params_from_iter(params_vec.iter().map(|b| b.as_ref())),
                    |r| r.get(0),
                )
                .map_err(RepositoryError::from)?;

            let total_errors: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM traces WHERE start_time >= ?1 AND start_time <= ?2{services_sql} AND status LIKE '%ERROR%'"
                    ),
                    params_from_iter(params_vec.iter().map(|b| b.as_ref())),
                    |r| r.get(0),
                )
                .map_err(RepositoryError::from)?;

            let active_services: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(DISTINCT service_name) FROM traces WHERE start_time >= ?1 AND start_time <= ?2{services_sql}"
                    ),
                    params_from_iter(params_vec.iter().map(|b| b.as_ref())),
                    |r| r.get(0),
                )
                .map_err(RepositoryError::from)?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT duration_us FROM traces WHERE start_time >= ?1 AND start_time <= ?2{services_sql} ORDER BY duration_us ASC"
                ))
                .map_err(RepositoryError::from)?;
            let durations: Vec<i64> = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |r| r.get(0))
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            let avg_latency_ms = if durations.is_empty() {
                0.0
            } else {
                (durations.iter().sum::<i64>() as f64 / durations.len() as f64) / 1000.0
            };
            // p99 = durations[ceil(0.99*n) - 1] on the ascending-sorted sequence (spec §4.2, §8).
            let p99_latency_us = if durations.is_empty() {
                0
            } else {
                let idx = ((durations.len() as f64) * 0.99).ceil() as usize;
                let idx = idx.saturating_sub(1).min(durations.len() - 1);
                durations[idx]
            };
            let error_rate_pct = if total_traces == 0 {
                0.0
            } else {
                (total_errors as f64 / total_traces as f64) * 100.0
            };

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT service_name,
                            SUM(CASE WHEN status LIKE '%ERROR%' THEN 1 ELSE 0 END) AS errs,
                            COUNT(*) AS total
                     FROM traces WHERE start_time >= ?1 AND start_time <= ?2{services_sql}
                     GROUP BY service_name
                     HAVING errs > 0
                     ORDER BY (CAST(errs AS REAL) / total) DESC
                     LIMIT 5"
                ))
                .map_err(RepositoryError::from)?;
            let top_failing_services = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |row| {
                    let service_name: String = row.get(0)?;
                    let errs: i64 = row.get(1)?;
                    let total: i64 = row.get(2)?;
                    Ok(ServiceErrorRate {
                        service_name,
                        error_rate_pct: (errs as f64 / total as f64) * 100.0,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            Ok(DashboardStats {
                total_traces,
                total_logs,
                total_errors,
                avg_latency_ms,
                error_rate_pct,
                active_services,
                p99_latency_us,
                top_failing_services,
            })
        })
        .await
    }

    async fn get_traffic_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> Result<Vec<TrafficPoint>, RepositoryError> {
        let services = services.to_vec();
        self.with_conn(move |conn| {
            let mut extra: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            let services_sql = services_clause("service_name", &services, &mut extra);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(start)), Box::new(fmt_ts(end))];
            params_vec.extend(extra);

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT start_time, status FROM traces
                     WHERE start_time >= ?1 AND start_time <= ?2{services_sql}"
                ))
                .map_err(RepositoryError::from)?;
            let rows = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            use std::collections::BTreeMap;
            let mut buckets: BTreeMap<DateTime<Utc>, (i64, i64)> = BTreeMap::new();
            for (ts, status) in rows {
                let t = parse_ts(&ts);
                let minute = Utc
                    .timestamp_opt(t.timestamp() - t.timestamp().rem_euclid(60), 0)
                    .unwrap();
                let entry = buckets.entry(minute).or_insert((0, 0));
                entry.0 += 1;
                if status.contains("ERROR") {
                    entry.1 += 1;
                }
            }

            Ok(buckets
                .into_iter()
                .map(|(timestamp, (count, error_count))| TrafficPoint {
                    timestamp,
                    count,
                    error_count,
                })
                .collect())
        })
        .await
    }

    async fn get_latency_heatmap(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> Result<Vec<LatencyPoint>, RepositoryError> {
        let services = services.to_vec();
        self.with_conn(move |conn| {
            let mut extra: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            let services_sql = services_clause("service_name", &services, &mut extra);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(fmt_ts(start)), Box::new(fmt_ts(end))];
            params_vec.extend(extra);

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT start_time, duration_us FROM traces
                     WHERE start_time >= ?1 AND start_time <= ?2{services_sql}
                     ORDER BY start_time DESC LIMIT 2000"
                ))
                .map_err(RepositoryError::from)?;
            let mut points = stmt
                .query_map(params_from_iter(params_vec.iter().map(|b| b.as_ref())), |row| {
                    Ok(LatencyPoint {
                        timestamp: parse_ts(&row.get::<_, String>(0)?),
                        duration_us: row.get(1)?,
                    })
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;
            points.sort_by_key(|p| p.timestamp);
            Ok(points)
        })
        .await
    }

    async fn get_service_map_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ServiceMapMetrics, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT span_id, parent_span_id, service_name, duration_us
                     FROM spans WHERE start_time >= ?1 AND start_time <= ?2",
                )
                .map_err(RepositoryError::from)?;
            let rows = stmt
                .query_map(params![fmt_ts(start), fmt_ts(end)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;

            use std::collections::HashMap;
            let span_service: HashMap<String, String> = rows
                .iter()
                .map(|(span_id, _, service, _)| (span_id.clone(), service.clone()))
                .collect();

            let mut node_stats: HashMap<String, (i64, i64)> = HashMap::new();
            let mut edge_stats: HashMap<(String, String), (i64, i64)> = HashMap::new();

            for (span_id, parent_span_id, service, duration_us) in &rows {
                if service.is_empty() {
                    continue;
                }
                let entry = node_stats.entry(service.clone()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += duration_us;

                let is_root = parent_span_id.is_empty() || parent_span_id.chars().all(|c| c == '0');
                if is_root {
                    continue;
                }
                if let Some(parent_service) = span_service.get(parent_span_id) {
                    if parent_service.is_empty() || parent_service == service {
                        continue;
                    }
                    let edge = edge_stats
                        .entry((parent_service.clone(), service.clone()))
                        .or_insert((0, 0));
                    edge.0 += 1;
                    edge.1 += duration_us;
                }
                let _ = span_id;
            }

            let nodes = node_stats
                .into_iter()
                .map(|(service_name, (total_calls, total_us))| ServiceMapNode {
                    service_name,
                    total_calls,
                    avg_duration_ms: round2(total_us as f64 / total_calls as f64 / 1000.0),
                })
                .collect();

            let edges = edge_stats
                .into_iter()
                .map(|((from_service, to_service), (call_count, total_us))| ServiceMapEdge {
                    from_service,
                    to_service,
                    call_count,
                    avg_duration_ms: round2(total_us as f64 / call_count as f64 / 1000.0),
                })
                .collect();

            Ok(ServiceMapMetrics { nodes, edges })
        })
        .await
    }

    async fn purge_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.with_conn(move |conn| {
            let n = conn
                .execute("DELETE FROM logs WHERE timestamp < ?1", params![fmt_ts(cutoff)])
                .map_err(RepositoryError::from)?;
            Ok(n as u64)
        })
        .await
    }

    async fn purge_traces(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.with_conn(move |conn| {
            let cutoff_s = fmt_ts(cutoff);
            conn.execute(
                "DELETE FROM spans WHERE trace_id IN (SELECT trace_id FROM traces WHERE start_time < ?1)",
                params![cutoff_s],
            )
            .map_err(RepositoryError::from)?;
            let n = conn
                .execute("DELETE FROM traces WHERE start_time < ?1", params![cutoff_s])
                .map_err(RepositoryError::from)?;
            Ok(n as u64)
        })
        .await
    }

    async fn vacuum(&self) -> Result<(), RepositoryError> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM").map_err(RepositoryError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_services(&self) -> Result<Vec<String>, RepositoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT service_name FROM traces ORDER BY service_name ASC")
                .map_err(RepositoryError::from)?;
            let services = stmt
                .query_map([], |r| r.get(0))
                .map_err(RepositoryError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RepositoryError::from)?;
            Ok(services)
        })
        .await
    }

    async fn get_metric_names(&self, service: Option<&str>) -> Result<Vec<String>, RepositoryError> {
        let service = service.map(str::to_string);
        self.with_conn(move |conn| {
            let names = if let Some(service) = service {
                let mut stmt = conn
                    .prepare(
                        "SELECT DISTINCT metric_name FROM metric_buckets WHERE service_name = ?1 ORDER BY metric_name ASC",
                    )
                    .map_err(RepositoryError::from)?;
                stmt.query_map(params![service], |r| r.get(0))
                    .map_err(RepositoryError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(RepositoryError::from)?
            } else {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT metric_name FROM metric_buckets ORDER BY metric_name ASC")
                    .map_err(RepositoryError::from)?;
                stmt.query_map([], |r| r.get(0))
                    .map_err(RepositoryError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(RepositoryError::from)?
            };
            Ok(names)
        })
        .await
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory(Arc::new(TelemetryRegistry::new())).unwrap()
    }

    fn sample_trace(id: &str, service: &str, status: &str) -> Trace {
        Trace {
            trace_id: id.to_string(),
            service_name: service.to_string(),
            start_time: Utc::now(),
            duration_us: 500_000,
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn double_insert_trace_is_idempotent() {
        let repo = repo();
        let trace = sample_trace("aa".repeat(16).as_str(), "svc", "STATUS_CODE_OK");
        repo.batch_create_traces(&[trace.clone()]).await.unwrap();
        repo.batch_create_traces(&[trace.clone()]).await.unwrap();
        let page = repo
            .get_traces_filtered(TraceFilter {
                start: Utc::now() - chrono::Duration::hours(1),
                end: Utc::now() + chrono::Duration::hours(1),
                services: vec![],
                status: None,
                search: None,
                limit: 10,
                offset: 0,
                sort_by: SortField::Timestamp,
                order: SortOrder::Desc,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn update_log_insight_is_one_shot() {
        let repo = repo();
        let log = Log {
            id: 0,
            trace_id: None,
            span_id: None,
            severity: "INFO".into(),
            body: compress::encode("hello"),
            service_name: "svc".into(),
            attributes: compress::encode_attributes(&serde_json::json!({})),
            timestamp: Utc::now(),
            insight: None,
        };
        repo.batch_create_logs(&[log]).await.unwrap();
        let page = repo
            .get_logs_filtered(LogFilter {
                service: None,
                severity: None,
                search: None,
                start: Utc::now() - chrono::Duration::hours(1),
                end: Utc::now() + chrono::Duration::hours(1),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        let id = page.logs[0].id;
        repo.update_log_insight(id, "insight-1").await.unwrap();
        let err = repo.update_log_insight(id, "insight-2").await.unwrap_err();
        assert!(matches!(err, RepositoryError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn purge_logs_respects_cutoff() {
        let repo = repo();
        let old = Log {
            id: 0,
            trace_id: None,
            span_id: None,
            severity: "INFO".into(),
            body: compress::encode("old"),
            service_name: "svc".into(),
            attributes: compress::encode_attributes(&serde_json::json!({})),
            timestamp: Utc::now() - chrono::Duration::days(10),
            insight: None,
        };
        let fresh = Log {
            timestamp: Utc::now(),
            ..old.clone()
        };
        repo.batch_create_logs(&[old, fresh]).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(1);
        let deleted = repo.purge_logs(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn log_search_matches_body_as_well_as_trace_id() {
        let repo = repo();
        let matching_body = Log {
            id: 0,
            trace_id: Some("feedface".repeat(4)),
            span_id: None,
            severity: "INFO".into(),
            body: compress::encode("connection refused by upstream"),
            service_name: "svc".into(),
            attributes: compress::encode_attributes(&serde_json::json!({})),
            timestamp: Utc::now(),
            insight: None,
        };
        let matching_trace = Log {
            trace_id: Some("abad1dea".repeat(4)),
            body: compress::encode("all good here"),
            ..matching_body.clone()
        };
        let unrelated = Log {
            trace_id: Some("00112233".repeat(4)),
            body: compress::encode("nothing to see"),
            ..matching_body.clone()
        };
        repo.batch_create_logs(&[matching_body, matching_trace.clone(), unrelated])
            .await
            .unwrap();

        let page = repo
            .get_logs_filtered(LogFilter {
                service: None,
                severity: None,
                search: Some("refused".to_string()),
                start: Utc::now() - chrono::Duration::hours(1),
                end: Utc::now() + chrono::Duration::hours(1),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(compress::decode(&page.logs[0].body), "connection refused by upstream");

        let page = repo
            .get_logs_filtered(LogFilter {
                service: None,
                severity: None,
                search: Some("abad1dea".to_string()),
                start: Utc::now() - chrono::Duration::hours(1),
                end: Utc::now() + chrono::Duration::hours(1),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].trace_id, matching_trace.trace_id);
    }
}
