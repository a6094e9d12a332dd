//! C8 — Health WS. On connect, increments the connection gauge and sends
//! one immediate health snapshot; then pushes the current snapshot every
//! 3 s until the client disconnects (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::telemetry::TelemetryRegistry;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(3);
/// Per-write timeout for this hub's sockets (spec §5).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle_socket(socket: WebSocket, telemetry: Arc<TelemetryRegistry>) {
    telemetry.inc_active_connections();
    let (mut sender, mut receiver) = socket.split();

    let initial = serde_json::to_string(&telemetry.get_health_snapshot()).unwrap_or_default();
    if tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(initial.into()))).await.is_err() {
        telemetry.dec_active_connections();
        return;
    }

    let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snapshot = serde_json::to_string(&telemetry.get_health_snapshot()).unwrap_or_default();
                if tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(snapshot.into()))).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!("health ws client disconnected");
    telemetry.dec_active_connections();
}
