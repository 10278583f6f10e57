//! Persistent message records.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::types::Message;

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace a message by id.
    async fn insert(&self, msg: &Message) -> Result<(), StorageError>;
    /// Replace an existing message; errors if the id is unknown.
    async fn update(&self, msg: &Message) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Message>, StorageError>;
    async fn list(&self) -> Result<Vec<Message>, StorageError>;
    async fn remove(&self, id: &str) -> Result<(), StorageError>;

    /// Messages the watchdog still has to act on: every NEW message followed
    /// by every DELEGATED-IN message, each group by priority (high first)
    /// then submission time.
    async fn queue(&self) -> Result<Vec<Message>, StorageError> {
        let mut pending: Vec<Message> = self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.status.is_pending())
            .collect();
        pending.sort_by_key(|m| (m.status.code(), Reverse(m.priority), m.submitted_at));
        Ok(pending)
    }

    /// Messages submitted on the given UTC day, oldest first.
    async fn read_by_date(&self, date: NaiveDate) -> Result<Vec<Message>, StorageError> {
        let mut found: Vec<Message> = self
            .list()
            .await?
            .into_iter()
            .filter(|m| submitted_on(m) == Some(date))
            .collect();
        found.sort_by_key(|m| m.submitted_at);
        Ok(found)
    }

    /// Retention sweep, independent of status. Returns the number removed.
    async fn delete_older_than(&self, cutoff: i64) -> Result<usize, StorageError> {
        let expired: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.submitted_at < cutoff)
            .map(|m| m.id)
            .collect();
        for id in &expired {
            self.remove(id).await?;
        }
        Ok(expired.len())
    }

    /// Test-data purge of every message routed to `modem_id`.
    async fn purge_modem(&self, modem_id: &str) -> Result<usize, StorageError> {
        let matching: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.modem_id == modem_id)
            .map(|m| m.id)
            .collect();
        for id in &matching {
            self.remove(id).await?;
        }
        Ok(matching.len())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.list().await?.len())
    }
}

fn submitted_on(msg: &Message) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(msg.submitted_at, 0).map(|dt| dt.date_naive())
}

pub struct InMemoryMessageStore {
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, msg: &Message) -> Result<(), StorageError> {
        self.messages
            .write()
            .await
            .insert(msg.id.clone(), msg.clone());
        Ok(())
    }

    async fn update(&self, msg: &Message) -> Result<(), StorageError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&msg.id) {
            Some(existing) => {
                *existing = msg.clone();
                Ok(())
            }
            None => Err(StorageError::DatabaseOp(format!(
                "message {} not found",
                msg.id
            ))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Message>, StorageError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Message>, StorageError> {
        Ok(self.messages.read().await.values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.messages.write().await.remove(id);
        Ok(())
    }
}

pub struct SledMessageStore {
    tree: sled::Tree,
}

impl SledMessageStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::DatabaseOpen {
            name: "messages".to_string(),
            source: e,
        })?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("messages")?;
        Ok(Self { tree })
    }
}

#[async_trait::async_trait]
impl MessageStore for SledMessageStore {
    async fn insert(&self, msg: &Message) -> Result<(), StorageError> {
        let value = bincode::serialize(msg)?;
        self.tree.insert(msg.id.as_bytes(), value)?;
        Ok(())
    }

    async fn update(&self, msg: &Message) -> Result<(), StorageError> {
        if !self.tree.contains_key(msg.id.as_bytes())? {
            return Err(StorageError::DatabaseOp(format!(
                "message {} not found",
                msg.id
            )));
        }
        self.insert(msg).await
    }

    async fn get(&self, id: &str) -> Result<Option<Message>, StorageError> {
        match self.tree.get(id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Message>, StorageError> {
        self.tree
            .iter()
            .map(|item| {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }
}

/// Open the configured message store backend.
pub fn open_message_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>, StorageError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryMessageStore::new())),
        _ => {
            let path = std::path::Path::new(&config.data_dir).join("messages");
            let path = path.to_string_lossy().to_string();
            tracing::info!("💾 Opening message store at {}", path);
            Ok(Arc::new(SledMessageStore::open(&path)?))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
