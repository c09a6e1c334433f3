//! WebSocket event feed: a current-state snapshot on connect, then every
//! job event as it happens. Slow clients lose oldest events, never newest,
//! and never slow the orchestrator down.

use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time;
use tracing::{debug, warn};

use crate::events::JobEvent;
use crate::jobs::Job;

use super::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame<'a> {
    Snapshot { jobs: &'a [Job] },
    Event(&'a JobEvent),
}

/// GET /api/ws
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let jobs = state.orchestrator.list().await;
    let snapshot = match serde_json::to_string(&WsFrame::Snapshot { jobs: &jobs }) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "could not serialize snapshot frame");
            return;
        }
    };
    if sender.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    let mut stream = state.orchestrator.subscribe();
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&WsFrame::Event(&event)) else {
                    continue;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Clients have nothing to say to us; ignore the rest.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(dropped = stream.dropped(), "websocket subscriber disconnected");
}
