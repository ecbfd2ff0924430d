//! Pub/sub bus adapter with a TTL'd key-value side.
//!
//! The bus is an acceleration layer: a lost message never corrupts state,
//! because the store remains the source of truth. Channel subscription
//! idempotency is enforced by the room manager's registry, not here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// A stream of messages published on one channel.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Next message, or `None` once the channel is unsubscribed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// JSON pub/sub on named channels plus TTL'd presence entries.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Begin delivery for `channel`. Subscribing twice to the same channel
    /// replaces the earlier delivery stream.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    async fn kv_set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn kv_get(&self, key: &str) -> Result<Option<String>>;
    async fn kv_del(&self, key: &str) -> Result<()>;

    /// Keys matching `pattern`. Supports the `prefix*` shape used for
    /// presence enumeration; anything else matches exactly.
    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

struct KvEntry {
    value: String,
    expires_at: Instant,
}

/// Shared state behind every handle of an in-process bus.
struct MemoryBusCore {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
}

/// In-process bus. Handles cloned from the same core see each other's
/// messages, which lets tests run a multi-instance fleet in one process.
pub struct MemoryBus {
    core: Arc<MemoryBusCore>,
    subscriptions: DashMap<String, u64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            core: Arc::new(MemoryBusCore {
                next_id: AtomicU64::new(0),
                channels: Mutex::new(HashMap::new()),
                kv: Mutex::new(HashMap::new()),
            }),
            subscriptions: DashMap::new(),
        }
    }

    /// A fresh handle on the same bus, as another server instance sees it.
    pub fn handle(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            subscriptions: DashMap::new(),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut channels = self.core.channels.lock().expect("bus lock poisoned");
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut channels = self.core.channels.lock().expect("bus lock poisoned");
            channels.entry(channel.to_string()).or_default().push((id, tx));
        }
        if let Some(old) = self.subscriptions.insert(channel.to_string(), id) {
            let mut channels = self.core.channels.lock().expect("bus lock poisoned");
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|(sub_id, _)| *sub_id != old);
            }
        }
        Ok(Subscription { receiver: rx })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if let Some((_, id)) = self.subscriptions.remove(channel) {
            let mut channels = self.core.channels.lock().expect("bus lock poisoned");
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                if subscribers.is_empty() {
                    channels.remove(channel);
                }
            }
        }
        Ok(())
    }

    async fn kv_set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut kv = self.core.kv.lock().expect("bus lock poisoned");
        kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.core.kv.lock().expect("bus lock poisoned");
        match kv.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kv_del(&self, key: &str) -> Result<()> {
        self.core.kv.lock().expect("bus lock poisoned").remove(key);
        Ok(())
    }

    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let kv = self.core.kv.lock().expect("bus lock poisoned");
        Ok(kv
            .iter()
            .filter(|(key, entry)| entry.expires_at > now && matches_pattern(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

fn transient(e: redis::RedisError) -> Error {
    Error::Transient(e.to_string())
}

/// Redis-backed bus for multi-instance deployments.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    listeners: DashMap<String, JoinHandle<()>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            listeners: DashMap::new(),
        })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(transient)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(transient)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(transient)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.listeners.insert(channel.to_string(), pump) {
            old.abort();
        }
        Ok(Subscription { receiver: rx })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if let Some((_, pump)) = self.listeners.remove(channel) {
            pump.abort();
        }
        Ok(())
    }

    async fn kv_set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(transient)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key).await.map_err(transient)
    }

    async fn kv_del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(transient)
    }

    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys::<_, Vec<String>>(pattern)
            .await
            .map_err(transient)
    }
}
