use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};

use crate::cache::MessageKey;

/// Identity of a scheduled side effect. Scheduling again under the same key
/// replaces the stale task, so a superseding event cancels deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// The short auto-read delay after a foreground live message.
    AutoRead(MessageKey),
    /// The debounced mark-all-read sweep after returning to the foreground.
    VisibilitySweep,
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Keyed, cancellable timers. Replaces ad-hoc sleeps so pending side effects
/// can be cancelled by id when a newer event supersedes them.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<TaskKey, Slot>>,
    next_generation: AtomicU64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` after `delay`, aborting any task already queued under
    /// `key`.
    pub async fn schedule<F>(self: &Arc<Self>, key: TaskKey, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::clone(self);
        let cleanup_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
            let mut tasks = scheduler.tasks.lock().await;
            if tasks
                .get(&cleanup_key)
                .is_some_and(|slot| slot.generation == generation)
            {
                tasks.remove(&cleanup_key);
            }
        });

        let mut tasks = self.tasks.lock().await;
        if let Some(stale) = tasks.insert(key, Slot { generation, handle }) {
            stale.handle.abort();
        }
    }

    pub async fn cancel(&self, key: &TaskKey) -> bool {
        let mut tasks = self.tasks.lock().await;
        if let Some(slot) = tasks.remove(key) {
            slot.handle.abort();
            true
        } else {
            false
        }
    }

    pub async fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, slot) in tasks.drain() {
            slot.handle.abort();
        }
    }

    pub async fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.tasks.lock().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn scheduling_under_the_same_key_replaces_the_stale_task() {
        let scheduler = Arc::new(TaskScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            scheduler
                .schedule(TaskKey::VisibilitySweep, Duration::from_millis(20), {
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&TaskKey::VisibilitySweep).await);
    }

    #[tokio::test]
    async fn cancel_prevents_the_task_from_firing() {
        let scheduler = Arc::new(TaskScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let key = TaskKey::AutoRead(MessageKey::Local(1));
        let fired_clone = Arc::clone(&fired);
        scheduler
            .schedule(key.clone(), Duration::from_millis(30), async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(scheduler.cancel(&key).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.cancel(&key).await);
    }
}
