//! Shared application state threaded through the HTTP/WebSocket router
//! (spec §6). Every field is a handle already wired up in `main.rs`;
//! `state.rs` itself owns no behavior beyond construction.

use std::sync::Arc;

use crate::ai::AiWorker;
use crate::config::Args;
use crate::dlq::DeadLetterQueue;
use crate::event_hub::EventHub;
use crate::hub::BroadcastHub;
use crate::repository::Repository;
use crate::telemetry::TelemetryRegistry;
use crate::tsdb::TsdbAggregator;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub telemetry: Arc<TelemetryRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub tsdb: Arc<TsdbAggregator>,
    pub broadcast_hub: Arc<BroadcastHub>,
    pub event_hub: Arc<EventHub>,
    pub ai_worker: Arc<AiWorker>,
    pub config: Arc<Args>,
}
