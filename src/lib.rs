//! Argus observability backend: OTLP ingestion, durable storage, TSDB
//! aggregation, a dead-letter queue, and real-time WebSocket/REST surfaces.

pub mod ai;
pub mod compress;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event_hub;
pub mod health_ws;
pub mod http;
pub mod hub;
pub mod models;
pub mod otlp;
pub mod repository;
pub mod state;
pub mod telemetry;
pub mod tsdb;
pub mod ws;
