use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use boardroom_core::session::GameId;
use boardroom_core::time::{Millis, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedEventKind {
    TokenUpdate,
    StateUpdate,
    GameStart,
}

/// A best-effort copy of a state change, kept so consumers can recover
/// from a dropped broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub id: u64,
    pub kind: QueuedEventKind,
    pub game_id: GameId,
    pub payload: serde_json::Value,
    pub enqueued_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("event queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventQueueStats {
    pub stored: usize,
    pub total_enqueued: u64,
    pub subscribers: usize,
}

/// Bounded in-memory queue with broadcast fan-out. Oldest entries are
/// evicted once `capacity` is reached.
pub struct EventQueue {
    events: Mutex<VecDeque<QueuedEvent>>,
    broadcast_tx: broadcast::Sender<QueuedEvent>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize, broadcast_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            events: Mutex::new(VecDeque::new()),
            broadcast_tx,
            capacity,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an event and publish it to subscribers.
    pub fn enqueue(
        &self,
        kind: QueuedEventKind,
        game_id: &str,
        payload: serde_json::Value,
    ) -> Result<u64, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let event = QueuedEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            game_id: game_id.to_string(),
            payload,
            enqueued_at: now_millis(),
        };
        let id = event.id;
        // No subscribers is fine; the event stays in the backlog.
        let _ = self.broadcast_tx.send(event.clone());

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
        Ok(id)
    }

    /// The most recent `count` events, newest first.
    pub fn recent(&self, count: usize) -> Vec<QueuedEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().rev().take(count).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueuedEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> EventQueueStats {
        let stored = self.events.lock().unwrap_or_else(|e| e.into_inner()).len();
        EventQueueStats {
            stored,
            total_enqueued: self.next_id.load(Ordering::Relaxed) - 1,
            subscribers: self.broadcast_tx.receiver_count(),
        }
    }
}
