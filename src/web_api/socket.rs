//! WebSocket update subscriptions
//!
//! Each socket registers one listener under the requesting user. Updates
//! are serialized into JSON envelopes and queued on an unbounded channel;
//! a closed socket surfaces as a send error, gets logged by the fan-out,
//! and the registration is removed in the handler's teardown.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection_manager::UpdateListener;
use crate::error::{Error, Result};
use crate::models::{Device, Event, Position};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub user_id: i64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SocketQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

struct WsUpdateListener {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl WsUpdateListener {
    fn send(&self, payload: serde_json::Value) -> Result<()> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| Error::Internal(format!("Socket {} closed", self.connection_id)))
    }
}

impl UpdateListener for WsUpdateListener {
    fn on_keepalive(&self) -> Result<()> {
        self.send(json!({"type": "keepalive"}))
    }

    fn on_update_device(&self, device: &Device) -> Result<()> {
        self.send(json!({"type": "device", "data": device}))
    }

    fn on_update_position(&self, position: &Position) -> Result<()> {
        self.send(json!({"type": "position", "data": position}))
    }

    fn on_update_event(&self, event: &Event) -> Result<()> {
        self.send(json!({"type": "event", "data": event}))
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = Uuid::new_v4();

    let listener: Arc<dyn UpdateListener> = Arc::new(WsUpdateListener { connection_id, tx });
    state.connections.add_listener(user_id, &listener).await;
    tracing::info!(connection_id = %connection_id, user_id, "Update socket connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    // Subscribers only listen; anything but close is ignored
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.connections.remove_listener(user_id, &listener).await;
    tracing::info!(connection_id = %connection_id, user_id, "Update socket disconnected");
}
