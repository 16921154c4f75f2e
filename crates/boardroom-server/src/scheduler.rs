//! Cancellable deferred work (forfeiture timers, delayed cleanup).
//!
//! Every task is a child of one root `CancellationToken`, so shutting the
//! scheduler down cancels everything still pending.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use boardroom_core::player::PlayerId;
use boardroom_core::session::GameId;

/// Identity of a deferred task. Scheduling a key that is already pending
/// replaces the earlier task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Forfeit { game_id: GameId, player_id: PlayerId },
    Cleanup { game_id: GameId },
}

impl TaskKey {
    pub fn forfeit(game_id: &str, player_id: &str) -> Self {
        Self::Forfeit {
            game_id: game_id.to_string(),
            player_id: player_id.to_string(),
        }
    }

    pub fn cleanup(game_id: &str) -> Self {
        Self::Cleanup {
            game_id: game_id.to_string(),
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            Self::Forfeit { game_id, .. } | Self::Cleanup { game_id } => game_id,
        }
    }
}

struct Pending {
    id: u64,
    token: CancellationToken,
}

struct Inner {
    root: CancellationToken,
    tasks: Mutex<HashMap<TaskKey, Pending>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Run `task` after `delay` unless cancelled first. Returns false when
    /// the scheduler is already shut down.
    pub fn schedule<F, Fut>(&self, key: TaskKey, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            return false;
        }
        let token = self.inner.root.child_token();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = tasks.insert(
                key.clone(),
                Pending {
                    id,
                    token: token.clone(),
                },
            ) {
                prev.token.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(?key, "Deferred task cancelled");
                },
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                        if tasks.get(&key).is_some_and(|p| p.id == id) {
                            tasks.remove(&key);
                        }
                    }
                    tracing::debug!(?key, "Running deferred task");
                    task().await;
                },
            }
        });
        true
    }

    /// Cancel a pending task. Returns true if one was pending.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let removed = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match removed {
            Some(p) => {
                p.token.cancel();
                true
            },
            None => false,
        }
    }

    /// Cancel every pending task belonging to `game_id`.
    pub fn cancel_game(&self, game_id: &str) -> usize {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<TaskKey> = tasks
            .keys()
            .filter(|k| k.game_id() == game_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(p) = tasks.remove(key) {
                p.token.cancel();
            }
        }
        keys.len()
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel the root token and forget all pending tasks.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
