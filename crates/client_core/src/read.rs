use std::sync::Arc;

use crate::{
    cache::{MessageCache, MessageKey},
    error::ClientError,
    schedule::{TaskKey, TaskScheduler},
};

/// Read/unread bookkeeping over a [`MessageCache`]. Keeps the pending
/// auto-read timers consistent with the flags: marking an entry read (by any
/// path) cancels its outstanding timer.
pub struct ReadTracker {
    scheduler: Arc<TaskScheduler>,
}

impl ReadTracker {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    /// No-op if the entry is already read. Returns whether anything changed.
    pub async fn mark_read(
        &self,
        cache: &mut MessageCache,
        key: MessageKey,
    ) -> Result<bool, ClientError> {
        self.scheduler.cancel(&TaskKey::AutoRead(key)).await;
        cache.mark_read(key).await
    }

    /// Marks every entry read; used by the debounced foreground sweep and the
    /// explicit mark-all control. Returns how many entries flipped.
    pub async fn mark_all_read(&self, cache: &mut MessageCache) -> Result<usize, ClientError> {
        let pending: Vec<MessageKey> = cache
            .entries()
            .iter()
            .filter(|entry| !entry.is_read)
            .map(|entry| entry.key)
            .collect();
        for key in pending {
            self.scheduler.cancel(&TaskKey::AutoRead(key)).await;
        }
        cache.mark_all_read().await
    }
}
