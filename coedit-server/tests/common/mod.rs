use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use coedit_server::bus::{MemoryBus, MessageBus};
use coedit_server::permission::Role;
use coedit_server::store::{Database, DocumentRecord, DocumentStore, UserRecord};
use coedit_server::{Identifier, ServerConfig, ServerState, server};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON messages.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let msg = self
                .0
                .next()
                .await
                .ok_or_else(|| anyhow!("WebSocket closed"))??;
            match msg {
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                other => {
                    let text = other.to_text().map_err(|_| anyhow!("non-string message"))?;
                    return Ok(serde_json::from_str(text)?);
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.0.close(None).await.ok();
    }
}

/// One server instance listening on an ephemeral port.
pub struct TestServer {
    pub state: Arc<ServerState>,
    pub store: Arc<Database>,
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestServer {
    /// Instance with its own temporary store and in-process bus.
    pub async fn start() -> Result<Self> {
        Self::start_with(Arc::new(Database::temporary().await?), MemoryBus::new()).await
    }

    /// Instance over a shared store and bus handle, for fleet tests.
    pub async fn start_with(store: Arc<Database>, bus: MemoryBus) -> Result<Self> {
        let state = ServerState::with_parts(
            ServerConfig::default(),
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::new(bus) as Arc<dyn MessageBus>,
        );
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server(Arc::clone(&state)).layer(TraceLayer::new_for_http());
        tokio::spawn(axum::serve(listener, router).into_future());
        Ok(Self {
            state,
            store,
            client: reqwest::Client::new(),
            addr,
        })
    }

    /// Register a user and mint a session token for them.
    pub async fn seed_user(&self, id: &str) -> String {
        let user_id: Identifier = id.parse().unwrap();
        let user = UserRecord {
            id: user_id.clone(),
            username: id.to_string(),
            email: format!("{id}@example.com"),
        };
        self.store.create_user(&user).await.unwrap();
        self.state.auth.issue(&user_id).unwrap()
    }

    /// Mint a token without registering the user.
    pub fn issue_token(&self, id: &str) -> String {
        self.state.auth.issue(&id.parse().unwrap()).unwrap()
    }

    pub async fn seed_document(&self, id: &str, owner: &str, content: &str) -> DocumentRecord {
        let mut record =
            DocumentRecord::new(id.parse().unwrap(), "untitled", owner.parse().unwrap());
        record.content = content.to_string();
        self.store.save(&record).await.unwrap();
        record
    }

    /// Grant (or change) a user's role on a document.
    pub async fn share(&self, id: &str, user: &str, role: Role) {
        let mut record = self
            .store
            .get_by_id(&id.parse().unwrap())
            .await
            .unwrap()
            .expect("document to share");
        record.shares.insert(user.parse().unwrap(), role);
        self.store.save(&record).await.unwrap();
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(anyhow!("unexpected status: {}", resp.status()));
        }
        Ok(resp.text().await?)
    }

    pub async fn expect_text(&self, id: &str, expected: &str) {
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected);
    }

    pub async fn connect(&self, token: &str) -> Result<JsonSocket> {
        let url = format!("ws://{}/api/socket?token={token}", self.addr);
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow!("connect failed: {e}"))?;
        Ok(JsonSocket(socket))
    }
}

/// Connect and join in one step, consuming the `document_state` reply.
pub async fn join_document(server: &TestServer, token: &str, id: &str) -> Result<(JsonSocket, Value)> {
    let mut socket = server.connect(token).await?;
    socket
        .send(&serde_json::json!({ "event": "join_document", "documentId": id }))
        .await;
    let state = socket.recv().await?;
    assert_eq!(state["event"], "document_state", "got {state}");
    Ok((socket, state))
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
