use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use boardroom_core::rules::{DiceRoller, RandomDice};

use crate::auth::AuthConfig;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::hub::broadcast::Broadcaster;
use crate::presence::PresenceTracker;
use crate::queue::EventQueue;
use crate::registry::{RegistryDeps, SessionRegistry};
use crate::scheduler::Scheduler;
use crate::store::GameStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub hub: Hub,
    pub store: Arc<dyn GameStore>,
    pub queue: Arc<EventQueue>,
    pub scheduler: Scheduler,
    pub auth: AuthConfig,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub sse_subscriber_count: Arc<AtomicUsize>,
    /// Root token; cancelling it stops the dispatch loop, the reaper,
    /// socket writers and every scheduled task.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the registry, hub and supporting services. Must run inside a
    /// tokio runtime: the hub's dispatch loop is spawned here.
    pub fn new(config: ServerConfig, store: Arc<dyn GameStore>) -> Self {
        Self::with_dice(config, store, Arc::new(RandomDice))
    }

    pub fn with_dice(
        config: ServerConfig,
        store: Arc<dyn GameStore>,
        dice: Arc<dyn DiceRoller>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new());
        let presence = Arc::new(PresenceTracker::new());
        let queue = Arc::new(EventQueue::new(
            config.limits.event_queue_capacity,
            config.limits.event_broadcast_capacity,
        ));
        let scheduler = Scheduler::new(shutdown.child_token());

        let registry = SessionRegistry::new(RegistryDeps {
            store: Arc::clone(&store),
            presence: Arc::clone(&presence),
            broadcaster: Arc::clone(&broadcaster),
            queue: Arc::clone(&queue),
            scheduler: scheduler.clone(),
            dice,
            config: config.sessions.clone(),
        });
        let (hub, _dispatch) = Hub::new(
            registry.clone(),
            broadcaster,
            presence,
            &config,
            shutdown.clone(),
        );

        let auth = AuthConfig {
            bearer_token: config.auth.bearer_token.clone(),
        };
        Self {
            registry,
            hub,
            store,
            queue,
            scheduler,
            auth,
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            sse_subscriber_count: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    pub fn ws_connections(&self) -> usize {
        self.ws_connection_count.load(Ordering::Relaxed)
    }

    pub fn sse_subscribers(&self) -> usize {
        self.sse_subscriber_count.load(Ordering::Relaxed)
    }
}

/// Holds one slot of a connection counter; released on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_slot_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ConnectionGuard::new(Arc::clone(&counter));
        let b = ConnectionGuard::new(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        drop(a);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(b);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
