use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{Role, TeacherCode};
use storage::LocalStore;
use tokio::sync::Mutex;

use crate::cache::CachedMessage;

/// Which message document a cache is backed by. One per role surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageLog {
    StudentInbox,
    TeacherInbox,
}

impl MessageLog {
    fn document_key(self) -> &'static str {
        match self {
            MessageLog::StudentInbox => "student_messages",
            MessageLog::TeacherInbox => "teacher_messages",
        }
    }
}

const SESSION_DOCUMENT_KEY: &str = "session";

/// The identity fields remembered across restarts, used to prefill the next
/// join. Not an authentication artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub role: Role,
    pub teacher_code: TeacherCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
}

/// Durable local state seam. Whole documents in, whole documents out; the
/// store never patches incrementally, so the persisted blob always equals the
/// last in-memory view.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_identity(&self) -> Result<Option<StoredIdentity>>;
    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()>;
    async fn load_messages(&self, log: MessageLog) -> Result<Vec<CachedMessage>>;
    async fn save_messages(&self, log: MessageLog, messages: &[CachedMessage]) -> Result<()>;
}

/// SQLite-backed implementation over the local document store.
pub struct SqliteStateStore {
    store: LocalStore,
}

impl SqliteStateStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        Ok(Self::new(LocalStore::open(database_url).await?))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        self.store.load(SESSION_DOCUMENT_KEY).await
    }

    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.store.store(SESSION_DOCUMENT_KEY, identity).await
    }

    async fn load_messages(&self, log: MessageLog) -> Result<Vec<CachedMessage>> {
        Ok(self
            .store
            .load(log.document_key())
            .await?
            .unwrap_or_default())
    }

    async fn save_messages(&self, log: MessageLog, messages: &[CachedMessage]) -> Result<()> {
        self.store.store(log.document_key(), &messages).await
    }
}

/// In-memory store for ephemeral clients and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    identity: Option<StoredIdentity>,
    logs: HashMap<MessageLog, Vec<CachedMessage>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        Ok(self.inner.lock().await.identity.clone())
    }

    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.inner.lock().await.identity = Some(identity.clone());
        Ok(())
    }

    async fn load_messages(&self, log: MessageLog) -> Result<Vec<CachedMessage>> {
        Ok(self
            .inner
            .lock()
            .await
            .logs
            .get(&log)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_messages(&self, log: MessageLog, messages: &[CachedMessage]) -> Result<()> {
        self.inner.lock().await.logs.insert(log, messages.to_vec());
        Ok(())
    }
}
