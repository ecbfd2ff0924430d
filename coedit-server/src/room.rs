//! Per-document editing rooms: local membership, presence, cursor traffic
//! and cross-instance fan-out.
//!
//! A room exists on an instance while at least one local session has the
//! document open. Everything that mutates document state funnels through the
//! room's per-document lock; the bus only accelerates delivery to peer
//! instances, it never carries authority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Identifier;
use crate::bus::MessageBus;
use crate::engine::{self, OpBuffer};
use crate::error::{Error, Result};
use crate::ot::Operation;
use crate::permission::{self, Access, Role};
use crate::session::ServerEvent;
use crate::store::DocumentStore;

/// Lifetime of a presence entry if its owner stops refreshing it.
pub const PRESENCE_TTL: Duration = Duration::from_secs(300);
/// Minimum spacing between accepted cursor updates per user per document.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(50);

/// A user's cursor, in UTF-16 code units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<(u32, u32)>,
}

/// Per-user state advertised on the bus so peer instances can enumerate
/// live participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: Identifier,
    pub username: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Identity and delivery channel of one connected session.
#[derive(Clone)]
pub struct SessionInfo {
    pub user_id: Identifier,
    pub username: String,
    pub outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionInfo {
    fn send(&self, event: ServerEvent) {
        // A closed receiver means the session is tearing down; its leave
        // path will run.
        self.outbound.send(event).ok();
    }
}

/// Envelope for every message crossing the bus, stamped with the origin
/// instance so it can suppress its own echo.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FanoutMessage {
    server_id: String,
    #[serde(flatten)]
    event: ServerEvent,
}

struct LocalUser {
    session: SessionInfo,
    role: Role,
    joined_at: DateTime<Utc>,
    last_cursor_at: Option<Instant>,
}

/// Local state for one open document on this instance.
struct Room {
    local_users: RwLock<HashMap<Identifier, LocalUser>>,
    /// The per-document serialization point: edits hold this across the
    /// whole transform-apply-persist sequence.
    buffer: Mutex<OpBuffer>,
    /// Ordered outbox draining onto the bus, so publish order matches
    /// version order without holding `buffer` across bus I/O.
    outbox: mpsc::UnboundedSender<(String, String)>,
}

impl Room {
    fn new(bus: Arc<dyn MessageBus>) -> Self {
        let (outbox, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            while let Some((channel, payload)) = rx.recv().await {
                if let Err(e) = bus.publish(&channel, payload).await {
                    // The store already accepted the edit; peers recover on
                    // the next successful message or re-join.
                    warn!("bus publish on {channel} failed: {e}");
                }
            }
        });
        Self {
            local_users: RwLock::new(HashMap::new()),
            buffer: Mutex::new(OpBuffer::default()),
            outbox,
        }
    }

    /// Queue a fan-out message for ordered delivery to peer instances.
    fn publish(&self, server_id: &str, channel: String, event: &ServerEvent) {
        let message = FanoutMessage {
            server_id: server_id.to_string(),
            event: event.clone(),
        };
        match serde_json::to_string(&message) {
            Ok(payload) => {
                self.outbox.send((channel, payload)).ok();
            }
            Err(e) => warn!("failed to encode fan-out message: {e}"),
        }
    }

    /// Deliver an event to every local session except `skip`.
    async fn broadcast(&self, event: &ServerEvent, skip: Option<&Identifier>) {
        let users = self.local_users.read().await;
        for (user_id, user) in users.iter() {
            if skip.is_some_and(|s| s == user_id) {
                continue;
            }
            user.session.send(event.clone());
        }
    }
}

fn doc_channel(id: &Identifier) -> String {
    format!("doc:{id}")
}
fn presence_channel(id: &Identifier) -> String {
    format!("presence:{id}")
}
fn presence_key(id: &Identifier, user: &Identifier) -> String {
    format!("presence:{id}:{user}")
}

/// Owns every room on this instance plus the bus subscription registry.
pub struct RoomManager {
    server_id: String,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn MessageBus>,
    rooms: DashMap<Identifier, Arc<Room>>,
    /// Subscribed channel names; guarded separately from any room.
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(server_id: String, store: Arc<dyn DocumentStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            server_id,
            store,
            bus,
            rooms: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Admit a session to a document's room and send it the authoritative
    /// document state.
    pub async fn join(&self, session: &SessionInfo, document_id: &Identifier) -> Result<()> {
        let (document, role) = permission::get_document_with_access(
            self.store.as_ref(),
            document_id,
            &session.user_id,
            Access::Read,
        )
        .await?;

        let room = Arc::clone(
            self.rooms
                .entry(document_id.clone())
                .or_insert_with(|| Arc::new(Room::new(Arc::clone(&self.bus))))
                .value(),
        );

        let joined_at = Utc::now();
        {
            let mut users = room.local_users.write().await;
            // A reconnecting user replaces their previous delivery channel.
            users.insert(
                session.user_id.clone(),
                LocalUser {
                    session: session.clone(),
                    role,
                    joined_at,
                    last_cursor_at: None,
                },
            );
        }

        let entry = PresenceEntry {
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            role,
            joined_at,
            cursor: None,
        };
        self.upsert_presence(document_id, &entry).await;

        self.ensure_subscribed(doc_channel(document_id), Arc::clone(&room))
            .await?;
        self.ensure_subscribed(presence_channel(document_id), Arc::clone(&room))
            .await?;

        session.send(ServerEvent::DocumentState {
            id: document.id.clone(),
            title: document.title.clone(),
            content: document.content.clone(),
            version: document.version,
            owner: document.owner.clone(),
            role,
            active_users: self.active_users(document_id).await,
        });

        let joined = ServerEvent::UserJoined {
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            role,
        };
        room.broadcast(&joined, Some(&session.user_id)).await;
        room.publish(&self.server_id, presence_channel(document_id), &joined);

        info!("user {} joined document {}", session.user_id, document_id);
        Ok(())
    }

    /// Run one edit through the serialized engine and fan the result out.
    pub async fn operation(
        &self,
        session: &SessionInfo,
        document_id: &Identifier,
        op: Operation,
    ) -> Result<()> {
        let room = self
            .rooms
            .get(document_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                Error::InvalidOperation("join the document before editing".to_string())
            })?;

        // Delivery is enqueued while the per-document lock is still held,
        // so the order every local session observes matches the order of
        // version assignment. The sends themselves are non-blocking.
        let mut buffer = room.buffer.lock().await;
        let accepted = engine::process_operation(
            self.store.as_ref(),
            &mut buffer,
            document_id,
            op,
            &session.user_id,
        )
        .await?;

        session.send(ServerEvent::OperationAck {
            operation: accepted.operation.clone(),
            version: accepted.version,
            user_id: session.user_id.clone(),
        });

        if !accepted.operation.is_noop() {
            let remote = ServerEvent::RemoteOperation {
                operation: accepted.operation,
                version: accepted.version,
                user_id: session.user_id.clone(),
                username: session.username.clone(),
            };
            room.broadcast(&remote, Some(&session.user_id)).await;
            room.publish(&self.server_id, doc_channel(document_id), &remote);
        }
        Ok(())
    }

    /// Relay a cursor update, dropping bursts under the per-user throttle.
    pub async fn cursor_move(
        &self,
        session: &SessionInfo,
        document_id: &Identifier,
        cursor: CursorPosition,
    ) {
        let Some(room) = self.rooms.get(document_id).map(|r| Arc::clone(r.value())) else {
            return;
        };

        let entry = {
            let mut users = room.local_users.write().await;
            let Some(user) = users.get_mut(&session.user_id) else {
                return;
            };
            let now = Instant::now();
            if user
                .last_cursor_at
                .is_some_and(|last| now.duration_since(last) < CURSOR_THROTTLE)
            {
                return;
            }
            user.last_cursor_at = Some(now);
            PresenceEntry {
                user_id: session.user_id.clone(),
                username: session.username.clone(),
                role: user.role,
                joined_at: user.joined_at,
                cursor: Some(cursor.clone()),
            }
        };

        room.broadcast(
            &ServerEvent::CursorMoved {
                user_id: session.user_id.clone(),
                username: session.username.clone(),
                cursor,
            },
            Some(&session.user_id),
        )
        .await;
        self.upsert_presence(document_id, &entry).await;
    }

    /// Remove a session from a room, tearing the room down when it was the
    /// last local participant.
    pub async fn leave(&self, session: &SessionInfo, document_id: &Identifier) {
        let Some(room) = self.rooms.get(document_id).map(|r| Arc::clone(r.value())) else {
            return;
        };

        let (removed, now_empty) = {
            let mut users = room.local_users.write().await;
            // A replaced session (same user reconnected) must not evict the
            // newer channel.
            let removed = users
                .get(&session.user_id)
                .is_some_and(|u| u.session.outbound.same_channel(&session.outbound))
                && users.remove(&session.user_id).is_some();
            (removed, users.is_empty())
        };
        if !removed {
            return;
        }

        if let Err(e) = self
            .bus
            .kv_del(&presence_key(document_id, &session.user_id))
            .await
        {
            warn!("failed to clear presence entry: {e}");
        }

        let left = ServerEvent::UserLeft {
            user_id: session.user_id.clone(),
            username: session.username.clone(),
        };
        room.broadcast(&left, Some(&session.user_id)).await;
        room.publish(&self.server_id, presence_channel(document_id), &left);

        if now_empty {
            // Dropping the room discards the operation buffer and closes
            // the outbox once queued messages have drained.
            self.rooms.remove(document_id);
            self.release_subscriptions(document_id).await;
            info!("room {} is empty, released", document_id);
        }
    }

    /// All live presence entries for a document, fleet-wide.
    async fn active_users(&self, document_id: &Identifier) -> Vec<PresenceEntry> {
        let pattern = format!("presence:{document_id}:*");
        let keys = match self.bus.kv_keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("failed to enumerate presence: {e}");
                return Vec::new();
            }
        };
        let mut entries = Vec::new();
        for key in keys {
            if let Ok(Some(value)) = self.bus.kv_get(&key).await
                && let Ok(entry) = serde_json::from_str::<PresenceEntry>(&value)
            {
                entries.push(entry);
            }
        }
        entries
    }

    async fn upsert_presence(&self, document_id: &Identifier, entry: &PresenceEntry) {
        let key = presence_key(document_id, &entry.user_id);
        match serde_json::to_string(entry) {
            Ok(value) => {
                if let Err(e) = self.bus.kv_set(&key, value, PRESENCE_TTL).await {
                    warn!("failed to update presence entry {key}: {e}");
                }
            }
            Err(e) => warn!("failed to encode presence entry: {e}"),
        }
    }

    /// Subscribe to a bus channel once; repeated joins are no-ops.
    async fn ensure_subscribed(&self, channel: String, room: Arc<Room>) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&channel) {
            return Ok(());
        }
        let mut subscription = self.bus.subscribe(&channel).await?;
        let server_id = self.server_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                deliver_remote(&server_id, &room, &payload).await;
            }
        });
        subscriptions.insert(channel, pump);
        Ok(())
    }

    async fn release_subscriptions(&self, document_id: &Identifier) {
        let mut subscriptions = self.subscriptions.lock().await;
        for channel in [doc_channel(document_id), presence_channel(document_id)] {
            if let Some(pump) = subscriptions.remove(&channel) {
                pump.abort();
            }
            if let Err(e) = self.bus.unsubscribe(&channel).await {
                warn!("failed to unsubscribe {channel}: {e}");
            }
        }
    }

    /// True while this instance holds bus subscriptions for the document.
    pub async fn is_subscribed(&self, document_id: &Identifier) -> bool {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions.contains_key(&doc_channel(document_id))
            || subscriptions.contains_key(&presence_channel(document_id))
    }
}

/// Fan a message received from the bus out to the room's local sessions,
/// unless this instance published it itself.
async fn deliver_remote(server_id: &str, room: &Room, payload: &str) {
    let message: FanoutMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("discarding malformed bus message: {e}");
            return;
        }
    };
    if message.server_id == server_id {
        return;
    }
    debug!("delivering remote event from instance {}", message.server_id);
    // Operations accepted elsewhere join the local buffer so that stale
    // edits arriving here still transform against the full history. The
    // lock stays held across the local fan-out to keep delivery in version
    // order relative to locally accepted edits.
    if let ServerEvent::RemoteOperation {
        operation, version, ..
    } = &message.event
    {
        let mut buffer = room.buffer.lock().await;
        buffer.push(*version, operation.clone());
        room.broadcast(&message.event, None).await;
    } else {
        room.broadcast(&message.event, None).await;
    }
}
