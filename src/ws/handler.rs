//! WebSocket upgrade handler and per-connection session

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::scheduler::{ConnectError, RoomCommand};
use crate::game::{ConnectionId, Outbound, PlayerInput, RoomHandle, RoomRegistry};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

pub const DEFAULT_ROOM: &str = "lobby";
const ROOM_NAME_MAX_LEN: usize = 32;

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Room to join; the default room when absent or unusable
    pub room: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum SendFailure {
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket: {0}")]
    Socket(#[from] axum::Error),
}

/// Room names are short ASCII slugs
pub fn room_name(raw: Option<&str>) -> String {
    let name = raw.map(str::trim).unwrap_or_default();
    let valid = !name.is_empty()
        && name.len() <= ROOM_NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        name.to_ascii_lowercase()
    } else {
        DEFAULT_ROOM.to_string()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let room = room_name(query.room.as_deref());
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, room = %room, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, conn_id, room, state.rooms))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, conn_id: ConnectionId, room: String, rooms: Arc<RoomRegistry>) {
    info!(conn_id = %conn_id, room = %room, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        conn_id,
        room: room.clone(),
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(conn_id = %conn_id, error = %e, "Failed to send welcome");
        return;
    }

    let (handle, outbound_rx) = match rooms.join(&room, conn_id, unix_millis()).await {
        Ok(joined) => joined,
        Err(ConnectError::Refused(err)) => {
            warn!(conn_id = %conn_id, room = %room, error = %err, "Join refused, closing");
            let refusal = ServerMsg::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            };
            if let Err(e) = send_msg(&mut ws_sink, &refusal).await {
                debug!(conn_id = %conn_id, error = %e, "Failed to send refusal");
            }
            let _ = ws_sink.close().await;
            return;
        }
        Err(e) => {
            error!(conn_id = %conn_id, error = %e, "Could not join room");
            return;
        }
    };

    run_session(conn_id, &handle, ws_sink, ws_stream, outbound_rx).await;

    info!(conn_id = %conn_id, room = %room, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    conn_id: ConnectionId,
    room: &RoomHandle,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    mut outbound_rx: broadcast::Receiver<Outbound>,
) {
    let rate_limiter = ConnectionRateLimiter::new();

    // Writer task: room broadcasts -> WebSocket, filtered to this connection
    let writer_handle = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(outbound) => {
                    if !outbound.audience.includes(conn_id) {
                        continue;
                    }
                    if let Err(e) = send_msg(&mut ws_sink, &outbound.msg).await {
                        debug!(conn_id = %conn_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(conn_id = %conn_id, lagged_count = n, "Client lagged, skipping {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(conn_id = %conn_id, "Room channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> room
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_intent() {
                    warn!(conn_id = %conn_id, "Rate limited intent");
                    continue;
                }

                let msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "Failed to parse client message");
                        continue;
                    }
                };
                let leaving = matches!(msg, ClientMsg::Leave);
                let input = PlayerInput {
                    conn_id,
                    msg,
                    received_at: unix_millis(),
                };
                if room.send(RoomCommand::Input(input)).await.is_err() {
                    debug!(conn_id = %conn_id, "Room stopped");
                    break;
                }
                if leaving {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(conn_id = %conn_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(conn_id = %conn_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Removal is idempotent, so this is safe after an explicit leave too
    let _ = room
        .send(RoomCommand::Input(PlayerInput {
            conn_id,
            msg: ClientMsg::Leave,
            received_at: unix_millis(),
        }))
        .await;

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), SendFailure> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
