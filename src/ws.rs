//! HTTP/WebSocket server for the UI (spec §6): the REST surface from
//! [`crate::http`] plus three WebSocket endpoints — `/ws` (C6 broadcast
//! hub), `/ws/events` (C7 per-client filtered event hub) and `/ws/health`
//! (C8 health push).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::health_ws;
use crate::http;
use crate::hub::{BroadcastHub, CLIENT_WRITE_TIMEOUT};
use crate::event_hub::{EventHub, EVENT_CLIENT_WRITE_TIMEOUT};
use crate::state::AppState;

pub async fn run_http_server_with_shutdown(
    state: AppState,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(broadcast_ws_handler))
        .route("/ws/events", get(event_ws_handler))
        .route("/ws/health", get(health_ws_handler))
        .merge(http::router())
        .layer(cors)
        .with_state(state);

    info!("HTTP server listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// /ws — broadcast hub (spec §4.6)
// ---------------------------------------------------------------------

async fn broadcast_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_broadcast_socket(socket, state.broadcast_hub))
}

async fn handle_broadcast_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = hub.register_client();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(payload) => {
                        let send = sender.send(Message::Text((*payload).clone().into()));
                        if timeout(CLIENT_WRITE_TIMEOUT, send).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    hub.unregister_client(client_id);
}

// ---------------------------------------------------------------------
// /ws/events — per-client filtered live view (spec §4.7)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct EventWsQuery {
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientServiceUpdate {
    service: String,
}

async fn event_ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<EventWsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_socket(socket, state.event_hub, q.service.unwrap_or_default()))
}

async fn handle_event_socket(socket: WebSocket, hub: Arc<EventHub>, initial_service: String) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = hub.register_client(initial_service.clone());

    if let Ok(snapshot) = hub.snapshot_for(&initial_service).await {
        if let Ok(text) = serde_json::to_string(&snapshot) {
            let _ = timeout(EVENT_CLIENT_WRITE_TIMEOUT, sender.send(Message::Text(text.into()))).await;
        }
    }

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(payload) => {
                        let send = sender.send(Message::Text((*payload).clone().into()));
                        if timeout(EVENT_CLIENT_WRITE_TIMEOUT, send).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Malformed updates are a silent no-op (spec §4.7).
                        if let Ok(update) = serde_json::from_str::<ClientServiceUpdate>(&text) {
                            hub.set_client_service(client_id, update.service);
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    hub.unregister_client(client_id);
}

// ---------------------------------------------------------------------
// /ws/health — health push (spec §4.8)
// ---------------------------------------------------------------------

async fn health_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| health_ws::handle_socket(socket, state.telemetry))
}
