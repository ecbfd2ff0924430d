//! Durable document and user records.
//!
//! The store is the source of truth for document content and versions; the
//! realtime layer treats it as a key-value interface over records.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::Identifier;
use crate::error::{Error, Result};
use crate::permission::Role;

/// Snapshots retained per document, oldest dropped.
pub const HISTORY_LIMIT: usize = 50;
/// Maximum accepted title length, in characters.
pub const TITLE_LIMIT: usize = 200;

/// One retained snapshot of a document's past content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub content_snapshot: String,
    pub edited_by: Identifier,
    pub timestamp: DateTime<Utc>,
}

/// A document as persisted in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Identifier,
    pub title: String,
    pub content: String,
    /// Starts at 1 and increases by exactly one per accepted operation.
    pub version: u64,
    pub owner: Identifier,
    #[serde(default)]
    pub shares: HashMap<Identifier, Role>,
    #[serde(default)]
    pub history: VecDeque<VersionEntry>,
}

impl DocumentRecord {
    pub fn new(id: Identifier, title: &str, owner: Identifier) -> Self {
        Self {
            id,
            title: title.chars().take(TITLE_LIMIT).collect(),
            content: String::new(),
            version: 1,
            owner,
            shares: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Record the pre-change content before an edit is applied.
    pub fn push_history(&mut self, edited_by: Identifier, timestamp: DateTime<Utc>) {
        self.history.push_back(VersionEntry {
            version: self.version,
            content_snapshot: self.content.clone(),
            edited_by,
            timestamp,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

/// A registered user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Identifier,
    pub username: String,
    pub email: String,
}

/// Key-value interface over document records, consumed by the realtime core.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get_by_id(&self, id: &Identifier) -> Result<Option<DocumentRecord>>;

    /// Persist content, version and history together. Must be atomic with
    /// respect to concurrent saves of the same id.
    async fn save(&self, record: &DocumentRecord) -> Result<()>;

    /// Documents the user owns or appears in the share table of. Not on the
    /// hot edit path.
    async fn find_shared_or_owned(&self, user_id: &Identifier) -> Result<Vec<DocumentRecord>>;

    async fn document_count(&self) -> Result<usize>;

    async fn load_user(&self, user_id: &Identifier) -> Result<Option<UserRecord>>;

    /// Register a new user. Fails with `Conflict` if the username is taken.
    async fn create_user(&self, user: &UserRecord) -> Result<()>;
}

/// File-backed store with an in-memory user cache.
#[derive(Debug)]
pub struct Database {
    storage: PathBuf,
    users: DashMap<Identifier, UserRecord>,
}

impl Database {
    pub async fn new(storage: PathBuf) -> anyhow::Result<Self> {
        if !storage.exists() {
            fs::create_dir_all(&storage).await?;
        }
        let this = Self {
            storage,
            users: DashMap::new(),
        };
        fs::create_dir_all(this.document_dir()).await?;
        fs::create_dir_all(this.user_dir()).await?;

        let mut entries = fs::read_dir(this.user_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file()
                || entry.path().extension().and_then(|s| s.to_str()) != Some("json")
            {
                continue;
            }
            let data = fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<UserRecord>(&data) {
                Ok(user) => {
                    this.users.insert(user.id.clone(), user);
                }
                Err(_) => warn!(
                    "skipping unreadable user file: {}",
                    entry.path().display()
                ),
            }
        }
        Ok(this)
    }

    /// Construct a store in a temporary directory for testing.
    pub async fn temporary() -> anyhow::Result<Self> {
        let storage = std::env::temp_dir().join(format!("coedit_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    fn document_dir(&self) -> PathBuf {
        self.storage.join("docs")
    }
    fn document_path(&self, id: &Identifier) -> PathBuf {
        self.document_dir().join(id.as_ref()).with_extension("json")
    }
    fn user_dir(&self) -> PathBuf {
        self.storage.join("users")
    }
    fn user_path(&self, id: &Identifier) -> PathBuf {
        self.user_dir().join(id.as_ref()).with_extension("json")
    }
}

#[async_trait]
impl DocumentStore for Database {
    async fn get_by_id(&self, id: &Identifier) -> Result<Option<DocumentRecord>> {
        let path = self.document_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Store(e.into()))?;
        let record = serde_json::from_str(&data).map_err(|e| Error::Store(e.into()))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &DocumentRecord) -> Result<()> {
        let path = self.document_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string(record).map_err(|e| Error::Store(e.into()))?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::write(&tmp, data).context("writing document")?;
            // Rename keeps the record whole under concurrent saves.
            std::fs::rename(&tmp, &path).context("replacing document")?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Store(e.into()))?
        .map_err(Error::Store)?;
        Ok(())
    }

    async fn find_shared_or_owned(&self, user_id: &Identifier) -> Result<Vec<DocumentRecord>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(self.document_dir())
            .await
            .map_err(|e| Error::Store(e.into()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Store(e.into()))?
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(entry.path())
                .await
                .map_err(|e| Error::Store(e.into()))?;
            if let Ok(record) = serde_json::from_str::<DocumentRecord>(&data)
                && (record.owner == *user_id || record.shares.contains_key(user_id))
            {
                found.push(record);
            }
        }
        Ok(found)
    }

    async fn document_count(&self) -> Result<usize> {
        let mut entries = fs::read_dir(self.document_dir())
            .await
            .map_err(|e| Error::Store(e.into()))?;
        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Store(e.into()))?
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("json") {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn load_user(&self, user_id: &Identifier) -> Result<Option<UserRecord>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn create_user(&self, user: &UserRecord) -> Result<()> {
        if self
            .users
            .iter()
            .any(|u| u.username == user.username || u.id == user.id)
        {
            return Err(Error::Conflict(format!(
                "username {} is taken",
                user.username
            )));
        }
        self.users.insert(user.id.clone(), user.clone());
        fs::write(
            self.user_path(&user.id),
            serde_json::to_string_pretty(user).map_err(|e| Error::Store(e.into()))?,
        )
        .await
        .map_err(|e| Error::Store(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
impl Drop for Database {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.storage.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.storage);
        }
    }
}
