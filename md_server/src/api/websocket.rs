//! WebSocket handler for the live schedule feed.
//!
//! # Connection Flow
//!
//! 1. Client connects via `GET /ws?client_id=<id>&categories=1,2&venues=3&last_seq=<n>`
//! 2. Server sends one catch-up frame:
//!    - `snapshot` when no `last_seq` was given
//!    - `replay` with every missed record after `last_seq`
//!    - `resync` with a full snapshot when `last_seq` is no longer retained
//! 3. Server streams `record` frames in sequence order
//! 4. Client sends `ack` after applying records and `ping` when idle; either
//!    keeps the connection alive
//!
//! A client that falls too far behind is sent an `error` frame and closed.
//! Reconnecting with the same `client_id` and its last applied sequence
//! number resumes without gaps.
//!
//! # Example
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:3000/ws?client_id=mat-2&venues=2&last_seq=41');
//!
//! ws.onmessage = (event) => {
//!   const frame = JSON.parse(event.data);
//!   if (frame.type === 'record') {
//!     apply(frame.record);
//!     ws.send(JSON.stringify({ type: 'ack', seq: frame.record.seq }));
//!   }
//! };
//! ```

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use matchday::{
    Match, MutationRecord, SyncStart, TopicFilter,
    hub::{ClientStatus, DisconnectReason},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AppState, topic_filter};
use crate::{logging, metrics};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Stable identity across reconnects; generated when absent
    client_id: Option<String>,
    categories: Option<String>,
    venues: Option<String>,
    /// Last sequence number the client applied
    last_seq: Option<u64>,
}

/// Client messages received via WebSocket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// Highest sequence number applied so far
    Ack { seq: u64 },
    Ping,
}

/// Frames sent to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Snapshot {
        client_id: String,
        seq: u64,
        matches: Vec<Match>,
    },
    Replay {
        client_id: String,
        records: Vec<MutationRecord>,
        head_seq: u64,
    },
    Resync {
        client_id: String,
        reason: String,
        seq: u64,
        matches: Vec<Match>,
    },
    Record { record: MutationRecord },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    fn from_start(client_id: String, start: &SyncStart) -> Self {
        match start {
            SyncStart::Snapshot { seq, matches } => ServerMessage::Snapshot {
                client_id,
                seq: *seq,
                matches: matches.clone(),
            },
            SyncStart::Replay { records, head_seq } => ServerMessage::Replay {
                client_id,
                records: records.iter().map(|r| r.as_ref().clone()).collect(),
                head_seq: *head_seq,
            },
            SyncStart::Resync {
                reason,
                seq,
                matches,
            } => ServerMessage::Resync {
                client_id,
                reason: reason.clone(),
                seq: *seq,
                matches: matches.clone(),
            },
        }
    }

    fn sync_kind(start: &SyncStart) -> &'static str {
        match start {
            SyncStart::Snapshot { .. } => "snapshot",
            SyncStart::Replay { .. } => "replay",
            SyncStart::Resync { .. } => "resync",
        }
    }

    fn to_text(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                None
            }
        }
    }
}

/// Upgrade HTTP connection to the live schedule feed.
///
/// # Query Parameters
///
/// - `client_id`: Identity used for reconnection; a UUID is assigned if absent
/// - `categories`, `venues`: Comma-separated ids to follow; all when absent
/// - `last_seq`: Resume after this sequence number
///
/// # Response
///
/// Upgrades to WebSocket (101 Switching Protocols), or `400 Bad Request`
/// for a malformed filter.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let filter = match topic_filter(query.categories.as_deref(), query.venues.as_deref()) {
        Ok(filter) => filter,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, client_id, filter, query.last_seq, state))
}

/// Handle an established WebSocket connection.
///
/// A send task forwards hub records and replies; the receive loop processes
/// acks and pings until the client goes away.
async fn handle_socket(
    socket: WebSocket,
    client_id: String,
    filter: TopicFilter,
    last_seq: Option<u64>,
    state: AppState,
) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = match state.hub.subscribe(client_id.clone(), filter, last_seq).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Subscription refused for {}: {}", client_id, e);
            let frame = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Some(message) = frame.to_text() {
                let _ = sender.send(message).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let sync = ServerMessage::sync_kind(&subscription.start);
    let start_seq = subscription.start.seq();
    info!("WebSocket connected: client={}, sync={}", client_id, sync);
    logging::log_client_event(&client_id, sync, Some(start_seq));
    metrics::realtime_connections_total(sync);
    metrics::realtime_clients_active(state.hub.client_count().await);

    let status = subscription.status_changes();
    let generation = subscription.generation();

    // Replies to client messages
    let (response_tx, mut response_rx) = tokio::sync::mpsc::channel::<ServerMessage>(32);

    let send_client_id = client_id.clone();
    let mut send_task = tokio::spawn(async move {
        let start = ServerMessage::from_start(send_client_id.clone(), &subscription.start);
        match start.to_text() {
            Some(message) => {
                if sender.send(message).await.is_err() {
                    return;
                }
            }
            None => return,
        }

        loop {
            let frame = tokio::select! {
                next = subscription.next() => match next {
                    Ok(record) => ServerMessage::Record { record: record.as_ref().clone() },
                    Err(e) => {
                        warn!("Closing feed for {}: {}", send_client_id, e);
                        let frame = ServerMessage::Error { message: e.to_string() };
                        if let Some(message) = frame.to_text() {
                            let _ = sender.send(message).await;
                        }
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(reply) = response_rx.recv() => reply,
            };

            let Some(message) = frame.to_text() else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
            metrics::realtime_frames_sent();
        }
    });

    let mut closed_by_client = false;

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ack { seq }) => {
                            state.hub.ack(&client_id, seq).await.err().map(|e| ServerMessage::Error {
                                message: e.to_string(),
                            })
                        }
                        Ok(ClientMessage::Ping) => match state.hub.heartbeat(&client_id).await {
                            Ok(()) => Some(ServerMessage::Pong),
                            Err(e) => Some(ServerMessage::Error { message: e.to_string() }),
                        },
                        Err(e) => {
                            warn!("Failed to parse client message: {}", e);
                            Some(ServerMessage::Error {
                                message: "Invalid message format".to_string(),
                            })
                        }
                    };

                    if let Some(reply) = reply
                        && response_tx.send(reply).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket closed: client={}", client_id);
                    closed_by_client = true;
                    break;
                }
                None => break,
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }

    send_task.abort();

    // Only the connection the hub still considers current may change it; a
    // superseded or already-dropped feed leaves the client entry alone, even
    // if the client reconnects between the status read and the release
    let ClientStatus { state: current, reason } = *status.borrow();
    if current.is_connected() {
        if let Err(e) = state
            .hub
            .release(&client_id, generation, closed_by_client)
            .await
        {
            warn!("Failed to release client {}: {}", client_id, e);
        }
    } else if let Some(reason) = reason
        && reason != DisconnectReason::Superseded
    {
        metrics::realtime_disconnects_total(&format!("{reason:?}"));
    }

    metrics::realtime_clients_active(state.hub.client_count().await);
    logging::log_client_event(&client_id, "disconnected", None);
    info!("WebSocket disconnected: client={}", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let ack: ClientMessage = serde_json::from_str(r#"{"type":"ack","seq":42}"#).unwrap();
        assert!(matches!(ack, ClientMessage::Ack { seq: 42 }));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"join"}"#).is_err());
    }

    #[test]
    fn test_server_frames_are_tagged() {
        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");

        let start = SyncStart::Snapshot {
            seq: 7,
            matches: Vec::new(),
        };
        let json = serde_json::to_value(ServerMessage::from_start("desk".to_string(), &start))
            .unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["client_id"], "desk");
    }
}
