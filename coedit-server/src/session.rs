//! One logical session per client connection: handshake identity, event
//! dispatch, keepalive and outbound delivery.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::Identifier;
use crate::ServerState;
use crate::error::Error;
use crate::ot::Operation;
use crate::permission::Role;
use crate::room::{CursorPosition, PresenceEntry, SessionInfo};

/// Keepalive ping spacing.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);
/// A session silent for this long is disconnected.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity resolved from the handshake credential.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user_id: Identifier,
    pub username: String,
}

/// A message received from the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Open a document and enter its room.
    #[serde(rename_all = "camelCase")]
    JoinDocument { document_id: Identifier },
    /// Leave the current room without closing the connection.
    LeaveDocument,
    /// An edit against the client's last known version.
    Operation { operation: Operation },
    /// Cursor or selection movement; throttled server-side.
    CursorMove { cursor: CursorPosition },
}

/// A message sent to the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Authoritative snapshot delivered on join.
    #[serde(rename_all = "camelCase")]
    DocumentState {
        id: Identifier,
        title: String,
        content: String,
        version: u64,
        owner: Identifier,
        role: Role,
        active_users: Vec<PresenceEntry>,
    },
    /// Acknowledges the originator's operation, with its transformed form.
    #[serde(rename_all = "camelCase")]
    OperationAck {
        operation: Operation,
        version: u64,
        user_id: Identifier,
    },
    /// Another participant's accepted operation.
    #[serde(rename_all = "camelCase")]
    RemoteOperation {
        operation: Operation,
        version: u64,
        user_id: Identifier,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: Identifier,
        username: String,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: Identifier,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    CursorMoved {
        user_id: Identifier,
        username: String,
        cursor: CursorPosition,
    },
    ErrorMessage { message: String },
}

/// Drive one websocket connection until it closes or times out.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, user: AuthenticatedUser) {
    info!("session opened for user {}", user.user_id);
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = SessionInfo {
        user_id: user.user_id.clone(),
        username: user.username.clone(),
        outbound: outbound_tx,
    };
    let mut current_document: Option<Identifier> = None;

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => {
                        dispatch(&state, &session, &mut current_document, text.as_str()).await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Binary(_) => {
                        session.outbound.send(ServerEvent::ErrorMessage {
                            message: "binary frames are not part of the protocol".to_string(),
                        }).ok();
                    }
                }
            }
            event = outbound_rx.recv() => {
                // The sender half lives in `session`, so this never yields None
                // while the loop runs.
                let Some(event) = event else { break };
                let serialized = match serde_json::to_string(&event) {
                    Ok(serialized) => serialized,
                    Err(e) => {
                        warn!("failed to serialize server event: {e}");
                        continue;
                    }
                };
                if sink.send(Message::text(serialized)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > CLIENT_TIMEOUT {
                    info!("session for {} timed out", user.user_id);
                    break;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Disconnect runs the normal leave pathway for the open document.
    if let Some(document_id) = current_document.take() {
        state.rooms.leave(&session, &document_id).await;
    }
    info!("session closed for user {}", user.user_id);
}

/// Handle one inbound frame. Errors are reported to the client; the
/// connection stays open.
async fn dispatch(
    state: &Arc<ServerState>,
    session: &SessionInfo,
    current_document: &mut Option<Identifier>,
    text: &str,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("unparseable client event: {e}");
            session
                .outbound
                .send(ServerEvent::ErrorMessage {
                    message: format!("invalid operation: unrecognized event ({e})"),
                })
                .ok();
            return;
        }
    };

    let result = match event {
        ClientEvent::JoinDocument { document_id } => {
            // Re-joining implicitly leaves the previous room; the fresh
            // document_state is authoritative for the client.
            if let Some(previous) = current_document.take() {
                state.rooms.leave(session, &previous).await;
            }
            match state.rooms.join(session, &document_id).await {
                Ok(()) => {
                    *current_document = Some(document_id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        ClientEvent::LeaveDocument => {
            if let Some(document_id) = current_document.take() {
                state.rooms.leave(session, &document_id).await;
            }
            Ok(())
        }
        ClientEvent::Operation { operation } => match current_document.as_ref() {
            Some(document_id) => state.rooms.operation(session, document_id, operation).await,
            None => Err(Error::InvalidOperation(
                "no document joined".to_string(),
            )),
        },
        ClientEvent::CursorMove { cursor } => {
            if let Some(document_id) = current_document.as_ref() {
                state.rooms.cursor_move(session, document_id, cursor).await;
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        session
            .outbound
            .send(ServerEvent::ErrorMessage {
                message: e.session_message(),
            })
            .ok();
    }
}
