//! Server backend for the Coedit collaborative document editor.
//!
//! Clients connect over websockets, join per-document rooms and exchange
//! operational-transform edits; a pub/sub bus fans accepted operations out
//! to peer instances so the whole fleet converges on the same text.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

pub mod auth;
pub mod bus;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod ot;
pub mod permission;
pub mod room;
pub mod session;
pub mod store;

pub use config::ServerConfig;

use crate::auth::Authenticator;
use crate::bus::{MemoryBus, MessageBus, RedisBus};
use crate::error::Error;
use crate::room::RoomManager;
use crate::store::{Database, DocumentStore};

/// Unique identifier for a document or user.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);
impl Identifier {
    /// Maximum length of an identifier, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}
impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("Identifier is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("Identifier is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("Identifier contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}
impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("Identifier contains invalid UTF-8")
    }
}
impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}
impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The shared state of the server, accessible from within request handlers.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: Arc<dyn DocumentStore>,
    pub bus: Arc<dyn MessageBus>,
    pub rooms: Arc<RoomManager>,
    pub auth: Authenticator,
    start_time: u64,
}

impl ServerState {
    /// Build state from configuration, connecting store and bus.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn DocumentStore> =
            Arc::new(Database::new(config.store_uri.clone()).await?);
        let bus: Arc<dyn MessageBus> = match &config.bus_url {
            Some(url) => Arc::new(RedisBus::connect(url).await?),
            None => {
                warn!("no bus configured, running single-instance with an in-process bus");
                Arc::new(MemoryBus::new())
            }
        };
        Ok(Self::with_parts(config, store, bus))
    }

    /// Build state around externally constructed store and bus. Tests use
    /// this to run several instances against one shared bus.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        let server_id = format!("{:016x}", rand::random::<u64>());
        info!("starting instance {server_id}");
        let auth = Authenticator::new(&config.jwt_secret, config.jwt_expires_in);
        let rooms = Arc::new(RoomManager::new(
            server_id,
            Arc::clone(&store),
            Arc::clone(&bus),
        ));
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime returned before UNIX_EPOCH")
            .as_secs();
        Arc::new(Self {
            config,
            store,
            bus,
            rooms,
            auth,
            start_time,
        })
    }

    /// State with a temporary store and in-process bus, for testing.
    pub async fn temporary() -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn DocumentStore> = Arc::new(Database::temporary().await?);
        Ok(Self::with_parts(
            ServerConfig::default(),
            store,
            Arc::new(MemoryBus::new()),
        ))
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Rooms currently open on this instance.
    open_rooms: usize,
    /// Documents persisted in the store.
    stored_documents: usize,
}

/// A combined router handling all server routes.
pub fn server(state: Arc<ServerState>) -> Router {
    let mut router = Router::new()
        .route("/api/socket", get(socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::clone(&state));

    if let Some(origin) = &state.config.client_url {
        match origin.parse::<HeaderValue>() {
            Ok(origin) => {
                router = router.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods(Any)
                        .allow_headers(Any),
                );
            }
            Err(e) => warn!("ignoring unparseable client url: {e}"),
        }
    }
    router
}

#[derive(Deserialize)]
struct SocketParams {
    token: String,
}

/// Handler for the `/api/socket?token=...` endpoint. The credential is
/// resolved before the upgrade; bad tokens never reach a room.
async fn socket_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<SocketParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    let user = state
        .auth
        .authenticate(state.store.as_ref(), &params.token)
        .await?;
    Ok(ws
        .on_upgrade(move |socket| session::handle_socket(socket, state, user))
        .into_response())
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Identifier>,
) -> Result<String, Error> {
    let document = state.store.get_by_id(&id).await?.ok_or(Error::NotFound)?;
    Ok(document.content)
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Result<Response, Error> {
    let stored_documents = state.store.document_count().await?;
    Ok(axum::Json(Stats {
        start_time: state.start_time,
        open_rooms: state.rooms.open_rooms(),
        stored_documents,
    })
    .into_response())
}
