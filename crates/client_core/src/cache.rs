use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::MessageId;

use crate::{
    durable::{MessageLog, StateStore},
    error::ClientError,
};

/// How a history reply is folded into the cache. `Replace` mirrors the
/// server's hide/delete state exactly; `Merge` keeps locally known entries
/// that the reply no longer carries (older relay variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    Merge,
    Replace,
}

/// Cache identity of one message. `Local` keys are allocated from a
/// session-monotonic counter while no server id is known and are superseded
/// in place once a matching server record arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKey {
    Server(MessageId),
    Local(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToStudent,
    ToTeacher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub key: MessageKey,
    pub sender: String,
    /// Raw text as received. Escaping is the renderer's responsibility.
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub is_read: bool,
    pub is_from_history: bool,
    /// Local wall-clock receipt time; display-only.
    pub received_at: DateTime<Utc>,
}

/// A normalized inbound record, from either a history reply or a live push.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub id: Option<MessageId>,
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

impl CachedMessage {
    fn matches(&self, incoming: &IncomingMessage) -> bool {
        match (self.key, incoming.id) {
            (MessageKey::Server(existing), Some(id)) => existing == id,
            // Fallback dedup key when either side has no server id yet.
            _ => self.body == incoming.body && self.timestamp == incoming.timestamp,
        }
    }
}

/// The ordered, deduplicated set of messages known to one client, persisted
/// whole to the durable store before any mutating operation returns.
pub struct MessageCache {
    store: Arc<dyn StateStore>,
    log: MessageLog,
    entries: Vec<CachedMessage>,
    next_local_id: u64,
}

impl MessageCache {
    pub async fn open(store: Arc<dyn StateStore>, log: MessageLog) -> Result<Self, ClientError> {
        let entries = store.load_messages(log).await?;
        let next_local_id = entries
            .iter()
            .filter_map(|entry| match entry.key {
                MessageKey::Local(id) => Some(id),
                MessageKey::Server(_) => None,
            })
            .max()
            .map_or(1, |max| max + 1);
        Ok(Self {
            store,
            log,
            entries,
            next_local_id,
        })
    }

    pub fn entries(&self) -> &[CachedMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_read).count()
    }

    pub fn get(&self, key: MessageKey) -> Option<&CachedMessage> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Folds a history reply into the cache. New entries arrive already read
    /// (history is something the user had a chance to see in a prior
    /// session). Returns the number of entries added. Replaying the same
    /// batch is a no-op beyond the first application.
    pub async fn merge_history(
        &mut self,
        batch: Vec<IncomingMessage>,
        mode: HistoryMode,
    ) -> Result<usize, ClientError> {
        let added = match mode {
            HistoryMode::Merge => self.merge_batch(batch),
            HistoryMode::Replace => self.replace_with_batch(batch),
        };
        self.entries
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.persist().await?;
        Ok(added)
    }

    fn merge_batch(&mut self, batch: Vec<IncomingMessage>) -> usize {
        let mut added = 0;
        for incoming in batch {
            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|entry| entry.matches(&incoming))
            {
                // Known entry: at most upgrade a fallback key to the server
                // id. Read state is left alone.
                if let (MessageKey::Local(_), Some(id)) = (existing.key, incoming.id) {
                    existing.key = MessageKey::Server(id);
                }
                continue;
            }
            let entry = self.entry_from_history(incoming, None);
            self.entries.push(entry);
            added += 1;
        }
        added
    }

    fn replace_with_batch(&mut self, batch: Vec<IncomingMessage>) -> usize {
        let previous = std::mem::take(&mut self.entries);
        let mut added = 0;
        for incoming in batch {
            if self.entries.iter().any(|entry| entry.matches(&incoming)) {
                continue;
            }
            let received_at = previous
                .iter()
                .find(|entry| entry.matches(&incoming))
                .map(|entry| entry.received_at);
            if received_at.is_none() {
                added += 1;
            }
            let entry = self.entry_from_history(incoming, received_at);
            self.entries.push(entry);
        }
        added
    }

    fn entry_from_history(
        &mut self,
        incoming: IncomingMessage,
        received_at: Option<DateTime<Utc>>,
    ) -> CachedMessage {
        CachedMessage {
            key: self.key_for(incoming.id),
            sender: incoming.sender,
            body: incoming.body,
            timestamp: incoming.timestamp,
            direction: incoming.direction,
            is_read: true,
            is_from_history: true,
            received_at: received_at.unwrap_or_else(Utc::now),
        }
    }

    /// Prepends one freshly pushed message, unread. Returns its cache key, or
    /// `None` when the push was a replay of something already cached (in
    /// which case at most the fallback key is upgraded).
    pub async fn receive_live(
        &mut self,
        incoming: IncomingMessage,
    ) -> Result<Option<MessageKey>, ClientError> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.matches(&incoming))
        {
            if let (MessageKey::Local(_), Some(id)) = (existing.key, incoming.id) {
                existing.key = MessageKey::Server(id);
                self.persist().await?;
            }
            return Ok(None);
        }

        let key = self.key_for(incoming.id);
        self.entries.insert(
            0,
            CachedMessage {
                key,
                sender: incoming.sender,
                body: incoming.body,
                timestamp: incoming.timestamp,
                direction: incoming.direction,
                is_read: false,
                is_from_history: false,
                received_at: Utc::now(),
            },
        );
        self.persist().await?;
        Ok(Some(key))
    }

    fn key_for(&mut self, id: Option<MessageId>) -> MessageKey {
        match id {
            Some(id) => MessageKey::Server(id),
            None => {
                let key = MessageKey::Local(self.next_local_id);
                self.next_local_id += 1;
                key
            }
        }
    }

    /// Removes one entry. A local projection only: the caller is responsible
    /// for server corroboration, and a rejected delete is never resurrected
    /// here.
    pub async fn remove(&mut self, key: MessageKey) -> Result<bool, ClientError> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    pub async fn remove_server_id(&mut self, id: MessageId) -> Result<bool, ClientError> {
        self.remove(MessageKey::Server(id)).await
    }

    pub async fn clear(&mut self) -> Result<(), ClientError> {
        self.entries.clear();
        self.persist().await
    }

    /// Flips one entry to read. Idempotent: already-read entries report
    /// `false` and are not re-persisted.
    pub async fn mark_read(&mut self, key: MessageKey) -> Result<bool, ClientError> {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.key == key) else {
            return Ok(false);
        };
        if entry.is_read {
            return Ok(false);
        }
        entry.is_read = true;
        self.persist().await?;
        Ok(true)
    }

    /// Marks everything read; returns how many entries flipped.
    pub async fn mark_all_read(&mut self) -> Result<usize, ClientError> {
        let mut changed = 0;
        for entry in &mut self.entries {
            if !entry.is_read {
                entry.is_read = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist().await?;
        }
        Ok(changed)
    }

    async fn persist(&self) -> Result<(), ClientError> {
        self.store
            .save_messages(self.log, &self.entries)
            .await
            .map_err(ClientError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryStateStore;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, minute, 0).unwrap()
    }

    fn history(id: i64, body: &str, minute: u32) -> IncomingMessage {
        IncomingMessage {
            id: Some(MessageId(id)),
            sender: "교사".to_string(),
            body: body.to_string(),
            timestamp: at(minute),
            direction: Direction::ToStudent,
        }
    }

    async fn open_cache() -> MessageCache {
        MessageCache::open(Arc::new(MemoryStateStore::default()), MessageLog::StudentInbox)
            .await
            .expect("open cache")
    }

    #[tokio::test]
    async fn merged_history_is_sorted_newest_first_and_read() {
        let mut cache = open_cache().await;
        let added = cache
            .merge_history(
                vec![history(1, "first", 1), history(3, "third", 3), history(2, "second", 2)],
                HistoryMode::Merge,
            )
            .await
            .expect("merge");

        assert_eq!(added, 3);
        let bodies: Vec<_> = cache.entries().iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["third", "second", "first"]);
        assert!(cache.entries().iter().all(|m| m.is_read && m.is_from_history));
        assert_eq!(cache.unread_count(), 0);
    }

    #[tokio::test]
    async fn merging_the_same_batch_twice_is_idempotent() {
        let mut cache = open_cache().await;
        let batch = vec![history(1, "a", 1), history(2, "b", 2)];
        cache
            .merge_history(batch.clone(), HistoryMode::Merge)
            .await
            .expect("merge");
        let first: Vec<_> = cache.entries().to_vec();

        let added = cache
            .merge_history(batch, HistoryMode::Merge)
            .await
            .expect("merge again");
        assert_eq!(added, 0);
        assert_eq!(cache.entries(), first.as_slice());
    }

    #[tokio::test]
    async fn merge_of_empty_batch_is_a_no_op() {
        let mut cache = open_cache().await;
        cache
            .merge_history(vec![history(1, "a", 1)], HistoryMode::Merge)
            .await
            .expect("merge");
        let settled: Vec<_> = cache.entries().to_vec();

        cache
            .merge_history(Vec::new(), HistoryMode::Merge)
            .await
            .expect("empty merge");
        assert_eq!(cache.entries(), settled.as_slice());
    }

    #[tokio::test]
    async fn ties_keep_arrival_order() {
        let mut cache = open_cache().await;
        cache
            .merge_history(vec![history(1, "earlier arrival", 5)], HistoryMode::Merge)
            .await
            .expect("merge");
        cache
            .merge_history(vec![history(2, "later arrival", 5)], HistoryMode::Merge)
            .await
            .expect("merge");

        let bodies: Vec<_> = cache.entries().iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["earlier arrival", "later arrival"]);
    }

    #[tokio::test]
    async fn replace_mode_drops_entries_the_server_no_longer_returns() {
        let mut cache = open_cache().await;
        cache
            .merge_history(
                vec![history(1, "kept", 1), history(2, "hidden later", 2)],
                HistoryMode::Replace,
            )
            .await
            .expect("first fetch");

        cache
            .merge_history(vec![history(1, "kept", 1)], HistoryMode::Replace)
            .await
            .expect("second fetch");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].key, MessageKey::Server(MessageId(1)));
    }

    #[tokio::test]
    async fn live_message_lands_at_the_front_unread() {
        let mut cache = open_cache().await;
        cache
            .merge_history(vec![history(1, "old", 1)], HistoryMode::Merge)
            .await
            .expect("merge");

        let key = cache
            .receive_live(IncomingMessage {
                id: Some(MessageId(9)),
                sender: "교사".to_string(),
                body: "fresh".to_string(),
                timestamp: at(30),
                direction: Direction::ToStudent,
            })
            .await
            .expect("receive")
            .expect("new entry");

        assert_eq!(cache.entries()[0].key, key);
        assert!(!cache.entries()[0].is_read);
        assert!(!cache.entries()[0].is_from_history);
        assert_eq!(cache.unread_count(), 1);
    }

    #[tokio::test]
    async fn replayed_live_push_is_dropped() {
        let mut cache = open_cache().await;
        let push = IncomingMessage {
            id: Some(MessageId(5)),
            sender: "교사".to_string(),
            body: "once".to_string(),
            timestamp: at(10),
            direction: Direction::ToStudent,
        };
        cache.receive_live(push.clone()).await.expect("first");
        let second = cache.receive_live(push).await.expect("second");
        assert!(second.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn history_supersedes_a_fallback_key_in_place() {
        let mut cache = open_cache().await;
        let key = cache
            .receive_live(IncomingMessage {
                id: None,
                sender: "교사".to_string(),
                body: "unacked".to_string(),
                timestamp: at(10),
                direction: Direction::ToStudent,
            })
            .await
            .expect("receive")
            .expect("new entry");
        assert!(matches!(key, MessageKey::Local(_)));

        cache
            .merge_history(vec![history(42, "unacked", 10)], HistoryMode::Merge)
            .await
            .expect("merge");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].key, MessageKey::Server(MessageId(42)));
        // The entry predates the history fetch; its read state is untouched.
        assert!(!cache.entries()[0].is_read);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let mut cache = open_cache().await;
        let key = cache
            .receive_live(IncomingMessage {
                id: Some(MessageId(1)),
                sender: "교사".to_string(),
                body: "hello".to_string(),
                timestamp: at(1),
                direction: Direction::ToStudent,
            })
            .await
            .expect("receive")
            .expect("new entry");

        assert!(cache.mark_read(key).await.expect("mark"));
        let after_first: Vec<_> = cache.entries().to_vec();
        assert!(!cache.mark_read(key).await.expect("mark again"));
        assert_eq!(cache.entries(), after_first.as_slice());
        assert_eq!(cache.unread_count(), 0);
    }

    #[tokio::test]
    async fn removed_entries_stay_removed() {
        let mut cache = open_cache().await;
        cache
            .merge_history(vec![history(42, "to delete", 1)], HistoryMode::Merge)
            .await
            .expect("merge");

        assert!(cache
            .remove(MessageKey::Server(MessageId(42)))
            .await
            .expect("remove"));
        assert!(cache.is_empty());
        assert!(!cache
            .remove(MessageKey::Server(MessageId(42)))
            .await
            .expect("remove again"));
    }

    #[tokio::test]
    async fn cache_reloads_from_the_store() {
        let store = Arc::new(MemoryStateStore::default());
        {
            let mut cache =
                MessageCache::open(Arc::clone(&store) as Arc<dyn StateStore>, MessageLog::StudentInbox)
                    .await
                    .expect("open");
            cache
                .merge_history(vec![history(1, "persisted", 1)], HistoryMode::Merge)
                .await
                .expect("merge");
        }

        let cache = MessageCache::open(store, MessageLog::StudentInbox)
            .await
            .expect("reopen");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].body, "persisted");
    }
}
