//! Connection hub: owns the live socket set per game, presence bookkeeping
//! and the inbound message surface. Game state is only ever read through
//! the registry; the per-game views cached here are presentation copies.

pub mod broadcast;
pub mod dispatch;
pub mod handler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use boardroom_core::GameError;
use boardroom_core::net::messages::{PlayerSummary, ServerMessage};
use boardroom_core::net::protocol::encode_server_message;
use boardroom_core::player::{PlayerId, PlayerStatus};
use boardroom_core::session::{GameId, GameStatus, SessionId};
use boardroom_core::time::{Millis, SECOND, now_millis};

use crate::config::{HubConfig, ServerConfig};
use crate::pipeline::{Frame, OutboundQueue, QueueLimits};
use crate::presence::{PresenceTracker, SessionStatus};
use crate::registry::{SessionRegistry, roster_of};

use self::broadcast::{Broadcaster, ClientHandle};
use self::dispatch::{DispatchChannels, Register, Unregister, spawn_dispatch};

/// Read-only snapshot of a game kept for presentation queries.
#[derive(Debug, Clone, PartialEq)]
pub struct GameView {
    pub status: GameStatus,
    pub host_id: PlayerId,
    pub players: Vec<PlayerSummary>,
    pub refreshed_at: Millis,
}

impl GameView {
    pub fn active_players(&self, game_id: &str) -> ServerMessage {
        ServerMessage::ActivePlayers {
            game_id: game_id.to_string(),
            host_id: self.host_id.clone(),
            players: self.players.clone(),
        }
    }
}

struct HubInner {
    registry: SessionRegistry,
    broadcaster: Arc<Broadcaster>,
    presence: Arc<PresenceTracker>,
    channels: DispatchChannels,
    views: RwLock<HashMap<GameId, GameView>>,
    config: HubConfig,
    max_message_size: usize,
    next_watcher_id: AtomicU64,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

fn hub_closed() -> GameError {
    GameError::Connection("hub is shut down".into())
}

impl Hub {
    /// Build a hub and spawn its dispatch loop. The loop stops when
    /// `shutdown` fires.
    pub fn new(
        registry: SessionRegistry,
        broadcaster: Arc<Broadcaster>,
        presence: Arc<PresenceTracker>,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (channels, handle) = spawn_dispatch(
            Arc::clone(&broadcaster),
            config.limits.hub_channel_capacity,
            shutdown,
        );
        let hub = Self {
            inner: Arc::new(HubInner {
                registry,
                broadcaster,
                presence,
                channels,
                views: RwLock::new(HashMap::new()),
                config: config.hub.clone(),
                max_message_size: config.limits.max_message_size,
                next_watcher_id: AtomicU64::new(1),
            }),
        };
        (hub, handle)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.inner.broadcaster
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.inner.presence
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    fn queue_limits(&self) -> QueueLimits {
        QueueLimits::from(&self.inner.config)
    }

    /// Admit a socket for a seated player.
    ///
    /// A socket whose session id differs from the latest one on record is a
    /// reconnection: its queue is primed with `reconnection_successful` and
    /// a full `complete_state_sync`, and it joins the broadcast set while
    /// the game's lock is still held. Every event the registry publishes is
    /// then either reflected in the sync or delivered after it, never both.
    pub async fn connect(
        &self,
        game_id: &str,
        player_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<Arc<ClientHandle>, GameError> {
        let session_id = session_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let registry = &self.inner.registry;

        let previous = self
            .inner
            .presence
            .latest_session(game_id, player_id)
            .filter(|prior| prior.session_id != session_id);
        let was_disconnected = registry
            .snapshot(game_id)
            .await?
            .player(player_id)
            .ok_or_else(|| GameError::player_not_found(player_id))?
            .status
            == PlayerStatus::Disconnected;

        if previous.is_some() && was_disconnected {
            match registry.player_reconnected(game_id, player_id, &session_id).await {
                Err(GameError::StateConflict(_)) => {
                    registry.attach_connection(game_id, player_id, &session_id).await?;
                },
                other => {
                    other?;
                },
            }
        } else {
            registry.attach_connection(game_id, player_id, &session_id).await?;
        }

        let now = now_millis();
        let client = Arc::new(ClientHandle::new(
            game_id.to_string(),
            player_id.to_string(),
            session_id.clone(),
            self.queue_limits(),
            now,
        ));
        self.inner
            .presence
            .record_session(game_id, player_id, &session_id, now);

        if let Some(prior) = &previous {
            let game = registry.lock_session(game_id).await?;
            client.send(&ServerMessage::ReconnectionSuccessful {
                game_id: game_id.to_string(),
                player_id: player_id.to_string(),
                session_id: session_id.clone(),
                previous_session_id: prior.session_id.clone(),
            })?;
            client.send(&ServerMessage::CompleteStateSync {
                game: Box::new((*game).clone()),
            })?;
            self.register(&client).await?;
            drop(game);
        } else {
            self.register(&client).await?;
        }

        tracing::info!(
            game_id,
            player_id,
            session_id = %session_id,
            reconnect = previous.is_some(),
            "Client connected"
        );
        if previous.is_some() {
            self.inner.broadcaster.broadcast_to_game_except(
                game_id,
                player_id,
                &ServerMessage::PlayerReconnected {
                    game_id: game_id.to_string(),
                    player_id: player_id.to_string(),
                },
            );
        }
        self.announce_roster(game_id).await;
        Ok(client)
    }

    async fn register(&self, client: &Arc<ClientHandle>) -> Result<(), GameError> {
        let (ack, rx) = oneshot::channel();
        self.inner
            .channels
            .register
            .send(Register::Client {
                client: Arc::clone(client),
                ack,
            })
            .await
            .map_err(|_| hub_closed())?;
        rx.await.map(drop).map_err(|_| hub_closed())
    }

    /// Tear down one socket: unregister, let the registry decide status
    /// and host succession, settle presence, then tell the remaining
    /// clients. A client already superseded by a newer socket is a no-op.
    pub async fn disconnect(&self, client: &ClientHandle, reason: &str) {
        let (ack, rx) = oneshot::channel();
        let request = Unregister::Client {
            game_id: client.game_id.clone(),
            player_id: client.player_id.clone(),
            session_id: client.session_id.clone(),
            ack,
        };
        if self.inner.channels.unregister.send(request).await.is_err() {
            return;
        }
        let Ok(Some(_)) = rx.await else {
            tracing::debug!(
                game_id = %client.game_id,
                player_id = %client.player_id,
                session_id = %client.session_id,
                "Client already retired"
            );
            return;
        };

        let game_id = client.game_id.as_str();
        let player_id = client.player_id.as_str();
        tracing::info!(
            game_id,
            player_id,
            session_id = %client.session_id,
            reason,
            "Client disconnected"
        );

        let outcome = match self.inner.registry.player_disconnected(game_id, player_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(
                    game_id,
                    player_id,
                    error = %e,
                    "Disconnect for a game no longer tracked"
                );
                return;
            },
        };

        let status = if outcome.grace {
            SessionStatus::Reconnecting
        } else {
            SessionStatus::Disconnected
        };
        self.inner
            .presence
            .update_status(game_id, player_id, &client.session_id, status, now_millis());

        for event in &outcome.events {
            self.inner.broadcaster.broadcast_to_game(game_id, event);
        }
        if let (Some(previous_host), Some(new_host)) = (outcome.previous_host, outcome.new_host) {
            self.inner.broadcaster.broadcast_to_game(
                game_id,
                &ServerMessage::HostChanged {
                    game_id: game_id.to_string(),
                    previous_host,
                    new_host,
                },
            );
        }
        self.announce_roster(game_id).await;
    }

    /// Unregister every client whose last pong is older than the
    /// inactivity window. Returns how many were removed.
    pub async fn sweep_inactive(&self, now: Millis) -> usize {
        let timeout = self.inner.config.inactivity_timeout_secs * SECOND;
        let stale = self.inner.broadcaster.stale_clients(now, timeout);
        for client in &stale {
            tracing::warn!(
                game_id = %client.game_id,
                player_id = %client.player_id,
                last_pong = client.last_pong(),
                "Client inactive, unregistering"
            );
            self.disconnect(client, "inactivity").await;
        }
        stale.len()
    }

    pub fn view(&self, game_id: &str) -> Option<GameView> {
        self.inner
            .views
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(game_id)
            .cloned()
    }

    /// Rebuild the cached view of one game from the registry. Drops the
    /// entry when the game is gone.
    pub async fn refresh_view(&self, game_id: &str) -> Option<GameView> {
        let Ok(game) = self.inner.registry.snapshot(game_id).await else {
            self.inner
                .views
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(game_id);
            return None;
        };
        let view = GameView {
            status: game.status,
            host_id: game.host_id.clone(),
            players: roster_of(&game, &self.inner.broadcaster),
            refreshed_at: now_millis(),
        };
        self.inner
            .views
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(game_id.to_string(), view.clone());
        Some(view)
    }

    async fn view_or_refresh(&self, game_id: &str) -> Result<GameView, GameError> {
        if let Some(view) = self.view(game_id) {
            return Ok(view);
        }
        self.refresh_view(game_id)
            .await
            .ok_or_else(|| GameError::game_not_found(game_id))
    }

    /// Refresh the view and rebroadcast `active_players`.
    pub async fn announce_roster(&self, game_id: &str) {
        if let Some(view) = self.refresh_view(game_id).await {
            self.inner
                .broadcaster
                .broadcast_to_game(game_id, &view.active_players(game_id));
        }
    }

    /// Periodic pass: refresh every game with live clients and rebroadcast
    /// its roster. Views of games without clients are dropped.
    pub async fn refresh_all(&self) -> usize {
        let games = self.inner.broadcaster.games_with_clients();
        for game_id in &games {
            self.announce_roster(game_id).await;
        }
        self.inner
            .views
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| games.contains(id));
        games.len()
    }

    /// Subscribe a socket to lobby listing updates. The current listing is
    /// queued before the watcher is registered.
    pub async fn watch_lobby(&self) -> Result<(u64, Arc<OutboundQueue>), GameError> {
        let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(OutboundQueue::new(self.queue_limits()));
        let listing = ServerMessage::LobbyUpdate {
            games: self.inner.registry.lobby_listing().await,
        };
        let frame = Frame::from(encode_server_message(&listing)?);
        if let Err(e) = queue.enqueue(frame, listing.priority()) {
            tracing::warn!(error = %e, "Failed to queue initial lobby listing");
        }

        let (ack, rx) = oneshot::channel();
        self.inner
            .channels
            .register
            .send(Register::LobbyWatcher {
                id,
                queue: Arc::clone(&queue),
                ack,
            })
            .await
            .map_err(|_| hub_closed())?;
        rx.await.map_err(|_| hub_closed())?;
        tracing::debug!(watcher = id, "Lobby watcher registered");
        Ok((id, queue))
    }

    pub async fn unwatch_lobby(&self, id: u64) {
        let _ = self
            .inner
            .channels
            .unregister
            .send(Unregister::LobbyWatcher { id })
            .await;
    }

    fn reply_error(&self, client: &ClientHandle, err: &GameError) {
        if let Err(e) = client.send(&ServerMessage::error(err)) {
            tracing::debug!(
                game_id = %client.game_id,
                player_id = %client.player_id,
                error = %e,
                "Could not deliver error event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardroom_core::net::protocol::decode_server_message;
    use boardroom_core::rules::ActionKind;
    use boardroom_core::test_helpers::SequenceDice;

    use crate::queue::EventQueue;
    use crate::registry::RegistryDeps;
    use crate::scheduler::Scheduler;
    use crate::store::InMemoryGameStore;

    pub(super) struct Harness {
        pub hub: Hub,
        pub shutdown: CancellationToken,
    }

    pub(super) fn harness() -> Harness {
        let config = ServerConfig::default();
        let shutdown = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new());
        let presence = Arc::new(PresenceTracker::new());
        let registry = SessionRegistry::new(RegistryDeps {
            store: Arc::new(InMemoryGameStore::new()),
            presence: Arc::clone(&presence),
            broadcaster: Arc::clone(&broadcaster),
            queue: Arc::new(EventQueue::new(64, 64)),
            scheduler: Scheduler::new(shutdown.child_token()),
            dice: Arc::new(SequenceDice::default()),
            config: config.sessions.clone(),
        });
        let (hub, _handle) = Hub::new(registry, broadcaster, presence, &config, shutdown.clone());
        Harness { hub, shutdown }
    }

    /// Every frame currently queued for `client`, decoded.
    pub(super) fn drain(client: &ClientHandle) -> Vec<ServerMessage> {
        client
            .queue()
            .drain_pending()
            .iter()
            .map(|f| decode_server_message(f).unwrap())
            .collect()
    }

    pub(super) fn kinds(msgs: &[ServerMessage]) -> Vec<&'static str> {
        msgs.iter().map(ServerMessage::kind).collect()
    }

    #[tokio::test]
    async fn connect_rejects_unseated_player() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        let Err(err) = h.hub.connect(&id, "stranger", None).await else {
            panic!("unseated player was admitted");
        };
        assert_eq!(err.code(), "not_found");
        assert_eq!(h.hub.broadcaster().client_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_is_primed_before_peer_traffic() {
        let h = harness();
        let reg = h.hub.registry();
        let id = reg.create_game("host1", "Test", 4).await.unwrap();
        reg.join_game(&id, "p2").await.unwrap();

        let host = h.hub.connect(&id, "host1", Some("h-1".into())).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", Some("p-1".into())).await.unwrap();
        drain(&host);
        drain(&p2);

        h.hub.disconnect(&p2, "socket closed").await;
        assert!(!h.hub.broadcaster().is_connected(&id, "p2"));
        let after = drain(&host);
        assert_eq!(kinds(&after), vec!["active_players"]);

        let back = h.hub.connect(&id, "p2", Some("p-2".into())).await.unwrap();
        let first = drain(&back);
        assert_eq!(first[0].kind(), "reconnection_successful");
        assert_eq!(first[1].kind(), "complete_state_sync");
        match &first[0] {
            ServerMessage::ReconnectionSuccessful {
                previous_session_id, ..
            } => assert_eq!(previous_session_id, "p-1"),
            other => panic!("unexpected {other:?}"),
        }
        let seen = kinds(&drain(&host));
        assert!(seen.contains(&"player_reconnected"));

        let game = reg.snapshot(&id).await.unwrap();
        assert_eq!(game.player("p2").unwrap().status, PlayerStatus::Connected);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn host_disconnect_emits_single_host_changed() {
        let h = harness();
        let reg = h.hub.registry();
        let id = reg.create_game("host1", "Test", 4).await.unwrap();
        reg.join_game(&id, "p2").await.unwrap();
        reg.join_game(&id, "p3").await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();
        let p3 = h.hub.connect(&id, "p3", None).await.unwrap();
        drain(&p2);
        drain(&p3);

        h.hub.disconnect(&host, "socket closed").await;
        let seen = drain(&p3);
        let changes: Vec<_> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::HostChanged { new_host, .. } => Some(new_host.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec!["p2".to_string()]);
        assert_eq!(h.hub.view(&id).unwrap().host_id, "p2");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn active_host_disconnect_names_one_successor() {
        let h = harness();
        let reg = h.hub.registry();
        let id = reg.create_game("host1", "Test", 4).await.unwrap();
        reg.join_game(&id, "p2").await.unwrap();
        reg.join_game(&id, "p3").await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();
        let p3 = h.hub.connect(&id, "p3", None).await.unwrap();
        reg.start_game(&id, "host1").await.unwrap();
        drain(&p2);
        drain(&p3);

        h.hub.disconnect(&host, "socket closed").await;

        let game = reg.snapshot(&id).await.unwrap();
        assert_eq!(game.status, GameStatus::Active);
        let expected = game.seats.iter().find(|s| *s != "host1").unwrap().clone();
        assert_eq!(game.host_id, expected);
        for client in [&p2, &p3] {
            let changes: Vec<_> = drain(client)
                .into_iter()
                .filter_map(|m| match m {
                    ServerMessage::HostChanged {
                        previous_host, new_host, ..
                    } => Some((previous_host, new_host)),
                    _ => None,
                })
                .collect();
            assert_eq!(changes, vec![("host1".to_string(), expected.clone())]);
        }
        h.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnect_during_peer_action_misses_nothing() {
        for _ in 0..20 {
            let h = harness();
            let reg = h.hub.registry();
            let id = reg.create_game("host1", "Test", 4).await.unwrap();
            reg.join_game(&id, "p2").await.unwrap();
            reg.join_game(&id, "p3").await.unwrap();
            let mut clients = Vec::new();
            for player in ["host1", "p2", "p3"] {
                clients.push(h.hub.connect(&id, player, None).await.unwrap());
            }
            reg.start_game(&id, "host1").await.unwrap();

            let game = reg.snapshot(&id).await.unwrap();
            let mover = game.current_turn.clone().unwrap();
            let away = game.seats.iter().find(|s| **s != mover).unwrap().clone();
            let away_client = clients.iter().find(|c| c.player_id == away).unwrap();
            h.hub.disconnect(away_client, "socket closed").await;

            let (back, rolled) = tokio::join!(
                h.hub.connect(&id, &away, Some(format!("{away}-2"))),
                reg.process_action(&id, &mover, ActionKind::RollDice),
            );
            let back = back.unwrap();
            rolled.unwrap();

            let frames = drain(&back);
            assert_eq!(kinds(&frames[..2]), vec!["reconnection_successful", "complete_state_sync"]);
            let ServerMessage::CompleteStateSync { game: synced } = &frames[1] else {
                panic!("expected a state sync, got {:?}", frames[1]);
            };
            let synced_pos = synced.player(&mover).unwrap().position;
            let actual_pos = reg.snapshot(&id).await.unwrap().player(&mover).unwrap().position;
            let rolls_seen = frames.iter().filter(|m| m.kind() == "dice_rolled").count();
            assert_eq!(actual_pos, 3);
            // Either the sync already holds the roll or the roll follows it.
            if synced_pos == actual_pos {
                assert_eq!(rolls_seen, 0);
            } else {
                assert_eq!(synced_pos, 0);
                assert_eq!(rolls_seen, 1);
            }
            h.shutdown.cancel();
        }
    }

    #[tokio::test]
    async fn superseded_socket_disconnect_is_ignored() {
        let h = harness();
        let reg = h.hub.registry();
        let id = reg.create_game("host1", "Test", 4).await.unwrap();
        let old = h.hub.connect(&id, "host1", Some("s1".into())).await.unwrap();
        let new = h.hub.connect(&id, "host1", Some("s2".into())).await.unwrap();
        assert!(old.is_closed());

        h.hub.disconnect(&old, "socket closed").await;
        assert!(h.hub.broadcaster().is_connected(&id, "host1"));
        assert!(!new.is_closed());
        let game = reg.snapshot(&id).await.unwrap();
        assert_eq!(game.player("host1").unwrap().status, PlayerStatus::Connected);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn inactivity_sweep_uses_disconnect_path() {
        let h = harness();
        let reg = h.hub.registry();
        let id = reg.create_game("host1", "Test", 4).await.unwrap();
        reg.join_game(&id, "p2").await.unwrap();
        let _host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();

        let later = p2.last_pong() + 91 * SECOND;
        p2.record_pong(later);
        assert_eq!(h.hub.sweep_inactive(later).await, 1);
        assert!(!h.hub.broadcaster().is_connected(&id, "host1"));
        assert!(h.hub.broadcaster().is_connected(&id, "p2"));
        let game = reg.snapshot(&id).await.unwrap();
        assert_eq!(game.host_id, "p2");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn lobby_watchers_receive_listing() {
        let h = harness();
        let (watcher, queue) = h.hub.watch_lobby().await.unwrap();
        let first: Vec<_> = queue
            .drain_pending()
            .iter()
            .map(|f| decode_server_message(f).unwrap())
            .collect();
        assert_eq!(first, vec![ServerMessage::LobbyUpdate { games: vec![] }]);

        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        let update = queue.drain_pending();
        match decode_server_message(&update[0]).unwrap() {
            ServerMessage::LobbyUpdate { games } => assert_eq!(games[0].game_id, id),
            other => panic!("unexpected {other:?}"),
        }

        h.hub.unwatch_lobby(watcher).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.hub.broadcaster().lobby_watcher_count(), 0);
        h.shutdown.cancel();
    }
}
