//! The authoritative set of live game sessions and every mutation on them.
//!
//! Two-level locking: the session map is held only to look up or insert a
//! session pointer, and each session's own mutex is held for the whole of
//! one mutation including its store write. Derived game events are
//! published before that lock is released, so anyone holding the lock sees
//! a state that already accounts for every event delivered so far.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use boardroom_core::GameError;
use boardroom_core::net::messages::{LobbyEntry, PlayerSummary, ServerMessage};
use boardroom_core::player::{Player, PlayerId, PlayerStatus, is_valid_identifier};
use boardroom_core::rules::{self, ActionKind, DiceRoller};
use boardroom_core::session::{
    GameId, GameSession, GameStatus, SessionId, generate_room_code, is_valid_room_code,
};
use boardroom_core::time::{Millis, SECOND, elapsed_since, now_millis};

use crate::config::SessionsConfig;
use crate::hub::broadcast::Broadcaster;
use crate::presence::{PresenceTracker, SessionStatus};
use crate::queue::{EventQueue, QueuedEventKind};
use crate::scheduler::{Scheduler, TaskKey};
use crate::store::{GameStore, StoreError};

const MAX_ROOM_CODE_ATTEMPTS: usize = 32;

pub type SharedSession = Arc<Mutex<GameSession>>;

/// Collaborators a registry is built from.
pub struct RegistryDeps {
    pub store: Arc<dyn GameStore>,
    pub presence: Arc<PresenceTracker>,
    pub broadcaster: Arc<Broadcaster>,
    pub queue: Arc<EventQueue>,
    pub scheduler: Scheduler,
    pub dice: Arc<dyn DiceRoller>,
    pub config: SessionsConfig,
}

struct Inner {
    sessions: RwLock<HashMap<GameId, SharedSession>>,
    room_codes: std::sync::Mutex<HashMap<String, GameId>>,
    store: Arc<dyn GameStore>,
    presence: Arc<PresenceTracker>,
    broadcaster: Arc<Broadcaster>,
    queue: Arc<EventQueue>,
    scheduler: Scheduler,
    dice: Arc<dyn DiceRoller>,
    config: SessionsConfig,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

/// What a disconnect changed. Events are returned, not published; the
/// caller owns their delivery (and the single `host_changed`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectOutcome {
    pub previous_host: Option<PlayerId>,
    pub new_host: Option<PlayerId>,
    pub abandoned: bool,
    /// Whether the seat is held for the reconnection grace window.
    pub grace: bool,
    pub events: Vec<ServerMessage>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub games: usize,
    pub lobby: usize,
    pub active: usize,
    pub paused: usize,
    pub finished: usize,
    pub players: usize,
}

/// Non-forfeited players in seat order, flagged with live-socket state.
pub(crate) fn roster_of(game: &GameSession, broadcaster: &Broadcaster) -> Vec<PlayerSummary> {
    game.seats
        .iter()
        .filter_map(|id| game.player(id))
        .filter(|p| !p.is_forfeited())
        .map(|p| {
            let connected = broadcaster.is_connected(&game.id, &p.id);
            PlayerSummary::from_player(p, &game.host_id, connected)
        })
        .collect()
}

fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

fn validate_id(kind: &str, value: &str) -> Result<(), GameError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(GameError::Validation(format!("invalid {kind}")))
    }
}

impl SessionRegistry {
    pub fn new(deps: RegistryDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                room_codes: std::sync::Mutex::new(HashMap::new()),
                store: deps.store,
                presence: deps.presence,
                broadcaster: deps.broadcaster,
                queue: deps.queue,
                scheduler: deps.scheduler,
                dice: deps.dice,
                config: deps.config,
            }),
        }
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.inner.config
    }

    async fn session(&self, game_id: &str) -> Result<SharedSession, GameError> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(game_id)
            .map(Arc::clone)
            .ok_or_else(|| GameError::game_not_found(game_id))
    }

    async fn all_sessions(&self) -> Vec<(GameId, SharedSession)> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect()
    }

    async fn persist(&self, game: &GameSession) {
        let result = match self.inner.store.update(game).await {
            Err(StoreError::NotFound(_)) => self.inner.store.insert(game).await,
            other => other,
        };
        if let Err(e) = result {
            tracing::warn!(game_id = %game.id, error = %e, "Failed to persist game");
        }
    }

    fn enqueue(&self, kind: QueuedEventKind, game_id: &str, payload: serde_json::Value) {
        if let Err(e) = self.inner.queue.enqueue(kind, game_id, payload) {
            tracing::warn!(game_id, ?kind, error = %e, "Failed to enqueue event");
        }
    }

    fn publish(&self, game_id: &str, events: &[ServerMessage]) {
        for event in events {
            self.inner.broadcaster.broadcast_to_game(game_id, event);
        }
    }

    fn publish_player(&self, game_id: &str, player: &PlayerSummary) {
        self.publish(
            game_id,
            &[ServerMessage::PlayerUpdated {
                game_id: game_id.to_string(),
                player: player.clone(),
            }],
        );
    }

    fn roster(&self, game: &GameSession) -> ServerMessage {
        ServerMessage::ActivePlayers {
            game_id: game.id.clone(),
            host_id: game.host_id.clone(),
            players: roster_of(game, &self.inner.broadcaster),
        }
    }

    async fn publish_roster(&self, game_id: &str) {
        if let Ok(msg) = self.active_players(game_id).await {
            self.inner.broadcaster.broadcast_to_game(game_id, &msg);
        }
    }

    async fn publish_lobby(&self) {
        if self.inner.broadcaster.lobby_watcher_count() == 0 {
            return;
        }
        let games = self.lobby_listing().await;
        self.inner
            .broadcaster
            .broadcast_to_lobby(&ServerMessage::LobbyUpdate { games });
    }

    /// First seat after the departing host that is present and holds a
    /// CONNECTED presence entry.
    fn find_successor(&self, game: &GameSession, departing: &str) -> Option<PlayerId> {
        game.seats
            .iter()
            .filter(|id| id.as_str() != departing)
            .find(|id| {
                game.player(id).is_some_and(|p| p.status.is_present())
                    && self.inner.presence.has_connected_session(&game.id, id)
            })
            .cloned()
    }

    async fn reserve_room_code(&self, game_id: &str) -> Result<String, GameError> {
        for _ in 0..MAX_ROOM_CODE_ATTEMPTS {
            let code = generate_room_code(&mut rand::rng());
            {
                let mut codes = self.inner.room_codes.lock().unwrap_or_else(|e| e.into_inner());
                if codes.contains_key(&code) {
                    continue;
                }
                codes.insert(code.clone(), game_id.to_string());
            }
            match self.inner.store.room_code_exists(&code).await {
                Ok(false) => return Ok(code),
                Ok(true) => {
                    self.release_room_code(&code);
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Room code check against store failed");
                    return Ok(code);
                },
            }
        }
        Err(GameError::ResourceExhausted(
            "could not allocate a unique room code".into(),
        ))
    }

    fn release_room_code(&self, code: &str) {
        self.inner
            .room_codes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(code);
    }

    fn schedule_cleanup(&self, game_id: &str, delay: Duration) {
        let registry = self.clone();
        let id = game_id.to_string();
        self.inner
            .scheduler
            .schedule(TaskKey::cleanup(game_id), delay, move || async move {
                if let Err(e) = registry.cleanup_abandoned_game(&id, false).await {
                    tracing::debug!(game_id = %id, error = %e, "Scheduled cleanup skipped");
                }
            });
    }

    fn schedule_forfeit(&self, game_id: &str, player_id: &str) {
        let registry = self.clone();
        let (gid, pid) = (game_id.to_string(), player_id.to_string());
        let delay = Duration::from_secs(self.inner.config.disconnect_grace_secs);
        self.inner
            .scheduler
            .schedule(TaskKey::forfeit(game_id, player_id), delay, move || async move {
                if let Err(e) = registry.expire_grace(&gid, &pid).await {
                    tracing::debug!(
                        game_id = %gid,
                        player_id = %pid,
                        error = %e,
                        "Forfeit skipped"
                    );
                }
            });
    }

    fn on_completed(&self, game_id: &str) {
        tracing::info!(game_id, "Game completed");
        let delay = Duration::from_secs(self.inner.config.completed_cleanup_delay_secs);
        self.schedule_cleanup(game_id, delay);
    }

    // ---- lifecycle -------------------------------------------------------

    /// Create a LOBBY game hosted by `host_id`. Returns the new game id.
    pub async fn create_game(
        &self,
        host_id: &str,
        name: &str,
        max_players: u8,
    ) -> Result<GameId, GameError> {
        validate_id("host id", host_id)?;
        let name = name.trim();
        validate_id("game name", name)?;

        let game_id = Uuid::new_v4().to_string();
        let room_code = self.reserve_room_code(&game_id).await?;
        let cfg = &self.inner.config;
        let max_players = cfg.clamp_max_players(max_players);
        let game = GameSession::new(
            game_id.clone(),
            room_code.clone(),
            name.to_string(),
            host_id.to_string(),
            max_players,
            cfg.starting_balance,
            now_millis(),
        );
        if let Err(e) = self.inner.store.insert(&game).await {
            tracing::warn!(game_id = %game_id, error = %e, "Failed to persist new game");
        }
        self.inner
            .sessions
            .write()
            .await
            .insert(game_id.clone(), Arc::new(Mutex::new(game)));

        tracing::info!(
            game_id = %game_id,
            host_id,
            room_code = %room_code,
            max_players,
            "Game created"
        );
        self.publish_lobby().await;
        Ok(game_id)
    }

    /// Seat `player_id` in a LOBBY game, or re-issue a session for a player
    /// already seated. Returns the new connection session id.
    pub async fn join_game(&self, game_id: &str, player_id: &str) -> Result<SessionId, GameError> {
        validate_id("player id", player_id)?;
        let shared = self.session(game_id).await?;
        let session_id = new_session_id();
        {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Lobby {
                return Err(GameError::conflict("game is not accepting players"));
            }
            let now = now_millis();
            if game.player(player_id).is_none() {
                if game.is_full() {
                    return Err(GameError::conflict("game is full"));
                }
                game.seat_player(Player::new(
                    player_id.to_string(),
                    self.inner.config.starting_balance,
                    now,
                ));
                tracing::info!(game_id, player_id, "Player joined");
            }
            game.add_connection(player_id, session_id.clone(), now);
            game.touch(now);
            self.persist(&game).await;
        }
        self.publish_roster(game_id).await;
        self.publish_lobby().await;
        Ok(session_id)
    }

    /// LOBBY → ACTIVE. Shuffles the seating, promotes every present player
    /// and hands the first turn to the first seat.
    pub async fn start_game(
        &self,
        game_id: &str,
        requester: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let (events, absent) = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Lobby {
                return Err(GameError::conflict("game is not in the lobby"));
            }
            let present = game.players.values().filter(|p| p.status.is_present()).count();
            if present < self.inner.config.min_players {
                return Err(GameError::conflict(format!(
                    "need at least {} players to start",
                    self.inner.config.min_players
                )));
            }
            if game.host_id != requester {
                return Err(GameError::Permission("only the host can start the game".into()));
            }

            let now = now_millis();
            game.seats.shuffle(&mut rand::rng());
            game.status = GameStatus::Active;
            game.started_at = Some(now);
            game.current_turn = None;
            let mut absent = Vec::new();
            for player in game.players.values_mut() {
                if player.status.is_present() {
                    player.status = PlayerStatus::Active;
                } else if player.status == PlayerStatus::Disconnected {
                    absent.push(player.id.clone());
                }
            }
            game.refresh_turn_order();
            let Some(current) = game.current_turn.clone() else {
                return Err(GameError::conflict("no player can take the first turn"));
            };
            game.touch(now);
            self.persist(&game).await;

            let events = vec![
                ServerMessage::GameStarted {
                    game_id: game.id.clone(),
                    turn_order: game.turn_order.clone(),
                    current_turn: current.clone(),
                },
                ServerMessage::GameTurn {
                    game_id: game.id.clone(),
                    player_id: current,
                },
            ];
            self.publish(game_id, &events);
            (events, absent)
        };

        for player_id in &absent {
            self.schedule_forfeit(game_id, player_id);
        }
        tracing::info!(game_id, requester, "Game started");
        self.enqueue(
            QueuedEventKind::GameStart,
            game_id,
            serde_json::to_value(&events[0]).unwrap_or_default(),
        );
        self.publish_lobby().await;
        Ok(events)
    }

    /// Validate and apply one game action for `player_id`.
    pub async fn process_action(
        &self,
        game_id: &str,
        player_id: &str,
        kind: ActionKind,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let (events, completed) = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Active {
                return Err(GameError::conflict("game is not active"));
            }
            let player = game
                .player(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            if player.status != PlayerStatus::Active {
                return Err(GameError::conflict("player is not active"));
            }
            if rules::requires_turn(&game, player_id, &kind)
                && game.current_turn.as_deref() != Some(player_id)
            {
                return Err(GameError::conflict("not your turn"));
            }

            let dice = self.inner.dice.as_ref();
            let events = rules::apply_action(&mut game, player_id, &kind, dice)?;
            game.touch(now_millis());
            if let Err(violation) = game.check_invariants() {
                tracing::error!(game_id, %violation, "Session invariant violated");
            }
            self.persist(&game).await;
            self.publish(game_id, &events);
            (events, game.status == GameStatus::Completed)
        };

        tracing::debug!(
            game_id,
            player_id,
            action = kind.name(),
            events = events.len(),
            "Action applied"
        );
        self.enqueue(
            QueuedEventKind::StateUpdate,
            game_id,
            serde_json::json!({ "player_id": player_id, "action": kind.name() }),
        );
        if completed {
            self.on_completed(game_id);
        }
        Ok(events)
    }

    /// Mark a player DISCONNECTED in place and run host succession.
    pub async fn player_disconnected(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<DisconnectOutcome, GameError> {
        let shared = self.session(game_id).await?;
        let now = now_millis();
        let mut outcome = DisconnectOutcome::default();
        {
            let mut game = shared.lock().await;
            let player = game
                .player_mut(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            let forfeited = player.is_forfeited();
            if !forfeited {
                player.status = PlayerStatus::Disconnected;
                player.disconnected_at = Some(now);
            }
            game.mark_connections_closed(player_id, now);

            if game.status == GameStatus::Active {
                let previous_turn = game.current_turn.clone();
                if game.active_players().is_empty() {
                    game.status = GameStatus::Paused;
                    game.auto_paused = true;
                    outcome.events.push(ServerMessage::GamePaused {
                        game_id: game.id.clone(),
                        by: player_id.to_string(),
                    });
                    tracing::info!(game_id, "Game paused, no active players left");
                }
                game.refresh_turn_order();
                if game.status == GameStatus::Active
                    && game.current_turn != previous_turn
                    && let Some(current) = game.current_turn.clone()
                {
                    outcome.events.push(ServerMessage::TurnChanged {
                        game_id: game.id.clone(),
                        previous: previous_turn,
                        current,
                    });
                }
            } else {
                game.refresh_turn_order();
            }

            if game.host_id == player_id && !game.status.is_finished() {
                outcome.previous_host = Some(player_id.to_string());
                match self.find_successor(&game, player_id) {
                    Some(next) => {
                        tracing::info!(
                            game_id,
                            previous = player_id,
                            new_host = %next,
                            "Host migrated"
                        );
                        game.host_id = next.clone();
                        outcome.new_host = Some(next);
                    },
                    None => {
                        tracing::info!(
                            game_id,
                            host_id = player_id,
                            "Host left with no successor, game abandoned"
                        );
                        game.status = GameStatus::Abandoned;
                        game.current_turn = None;
                        game.auto_paused = false;
                        outcome.abandoned = true;
                    },
                }
            }
            outcome.grace = !forfeited && game.status.is_in_progress();
            game.touch(now);
            self.persist(&game).await;
        }

        if outcome.abandoned {
            self.inner.scheduler.cancel_game(game_id);
            let delay = Duration::from_secs(self.inner.config.abandoned_cleanup_delay_secs);
            self.schedule_cleanup(game_id, delay);
            self.publish_lobby().await;
        } else if outcome.grace {
            self.schedule_forfeit(game_id, player_id);
        }
        Ok(outcome)
    }

    /// Reconnection grace expired: forfeit the player if they are still gone.
    pub async fn expire_grace(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let (events, completed) = {
            let mut game = shared.lock().await;
            let still_gone = game
                .player(player_id)
                .is_some_and(|p| p.status == PlayerStatus::Disconnected);
            if !still_gone || !game.status.is_in_progress() {
                return Ok(Vec::new());
            }
            let events = rules::forfeit_player(&mut game, player_id);
            game.touch(now_millis());
            self.persist(&game).await;
            self.publish(game_id, &events);
            (events, game.status == GameStatus::Completed)
        };

        self.inner
            .presence
            .settle_player(game_id, player_id, SessionStatus::Disconnected);
        tracing::info!(game_id, player_id, "Player forfeited after reconnection grace");
        if completed {
            self.on_completed(game_id);
        }
        self.publish_roster(game_id).await;
        Ok(events)
    }

    /// Record `session_id` as live and bring a DISCONNECTED player back.
    fn connect_locked(
        &self,
        game: &mut GameSession,
        player_id: &str,
        session_id: &str,
        now: Millis,
    ) -> Vec<ServerMessage> {
        match game
            .connections
            .iter_mut()
            .find(|c| c.player_id == player_id && c.session_id == session_id)
        {
            Some(conn) => {
                conn.is_connected = true;
                conn.disconnected_at = None;
            },
            None => game.add_connection(player_id, session_id.to_string(), now),
        }
        game.touch(now);

        if game.player(player_id).is_none_or(|p| p.status != PlayerStatus::Disconnected) {
            return Vec::new();
        }
        self.inner.scheduler.cancel(&TaskKey::forfeit(&game.id, player_id));
        let restored = if game.status.is_in_progress() {
            PlayerStatus::Active
        } else {
            PlayerStatus::Connected
        };
        if let Some(p) = game.player_mut(player_id) {
            p.status = restored;
            p.disconnected_at = None;
        }

        let mut events = Vec::new();
        if game.status == GameStatus::Paused && game.auto_paused {
            game.status = GameStatus::Active;
            game.auto_paused = false;
            game.refresh_turn_order();
            events.push(ServerMessage::GameResumed {
                game_id: game.id.clone(),
                by: player_id.to_string(),
            });
            if let Some(current) = game.current_turn.clone() {
                events.push(ServerMessage::GameTurn {
                    game_id: game.id.clone(),
                    player_id: current,
                });
            }
            tracing::info!(game_id = %game.id, player_id, "Game resumed on reconnection");
        } else {
            game.refresh_turn_order();
        }
        events
    }

    /// Attach a socket session to a seated player, restoring them if they
    /// were DISCONNECTED.
    pub async fn attach_connection(
        &self,
        game_id: &str,
        player_id: &str,
        session_id: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let events = {
            let mut game = shared.lock().await;
            if game.player(player_id).is_none() {
                return Err(GameError::player_not_found(player_id));
            }
            let events = self.connect_locked(&mut game, player_id, session_id, now_millis());
            self.persist(&game).await;
            self.publish(game_id, &events);
            events
        };
        Ok(events)
    }

    /// A DISCONNECTED player is back on a new session.
    pub async fn player_reconnected(
        &self,
        game_id: &str,
        player_id: &str,
        session_id: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let events = {
            let mut game = shared.lock().await;
            let player = game
                .player(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            if player.status != PlayerStatus::Disconnected {
                return Err(GameError::conflict("player is not disconnected"));
            }
            let events = self.connect_locked(&mut game, player_id, session_id, now_millis());
            self.persist(&game).await;
            self.publish(game_id, &events);
            events
        };
        tracing::info!(game_id, player_id, session_id, "Player reconnected");
        Ok(events)
    }

    /// Issue a fresh session for a seated player of an ACTIVE game.
    pub async fn rejoin_game(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<SessionId, GameError> {
        let shared = self.session(game_id).await?;
        let session_id = new_session_id();
        let events = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Active {
                return Err(GameError::conflict("game is not active"));
            }
            let player = game
                .player(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            if player.is_forfeited() {
                return Err(GameError::conflict("player has forfeited"));
            }
            let events = self.connect_locked(&mut game, player_id, &session_id, now_millis());
            self.persist(&game).await;
            self.publish(game_id, &events);
            events
        };
        tracing::info!(game_id, player_id, "Player rejoined");
        Ok(session_id)
    }

    /// ABANDONED → LOBBY with `requester` as the new host.
    pub async fn reset_game_status(&self, game_id: &str, requester: &str) -> Result<(), GameError> {
        let shared = self.session(game_id).await?;
        {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Abandoned {
                return Err(GameError::conflict("game is not abandoned"));
            }
            if game.player(requester).is_none() {
                return Err(GameError::player_not_found(requester));
            }
            let balance = self.inner.config.starting_balance;
            for player in game.players.values_mut() {
                player.reset_for_lobby(balance);
            }
            game.status = GameStatus::Lobby;
            game.host_id = requester.to_string();
            game.started_at = None;
            game.current_turn = None;
            game.auto_paused = false;
            game.board = Default::default();
            game.refresh_turn_order();
            game.touch(now_millis());
            self.persist(&game).await;
        }
        self.inner.scheduler.cancel_game(game_id);
        tracing::info!(game_id, host_id = requester, "Abandoned game reset to lobby");
        self.publish_roster(game_id).await;
        self.publish_lobby().await;
        Ok(())
    }

    pub async fn pause_game(
        &self,
        game_id: &str,
        requester: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let events = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Active {
                return Err(GameError::conflict("game is not active"));
            }
            if game.host_id != requester {
                return Err(GameError::Permission("only the host can pause the game".into()));
            }
            game.status = GameStatus::Paused;
            game.auto_paused = false;
            game.refresh_turn_order();
            game.touch(now_millis());
            self.persist(&game).await;
            let events = vec![ServerMessage::GamePaused {
                game_id: game.id.clone(),
                by: requester.to_string(),
            }];
            self.publish(game_id, &events);
            events
        };
        tracing::info!(game_id, requester, "Game paused");
        Ok(events)
    }

    pub async fn resume_game(
        &self,
        game_id: &str,
        requester: &str,
    ) -> Result<Vec<ServerMessage>, GameError> {
        let shared = self.session(game_id).await?;
        let events = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Paused {
                return Err(GameError::conflict("game is not paused"));
            }
            if game.host_id != requester {
                return Err(GameError::Permission("only the host can resume the game".into()));
            }
            if game.active_players().is_empty() {
                return Err(GameError::conflict("no active players to resume with"));
            }
            game.status = GameStatus::Active;
            game.auto_paused = false;
            game.refresh_turn_order();
            game.touch(now_millis());
            self.persist(&game).await;
            let mut events = vec![ServerMessage::GameResumed {
                game_id: game.id.clone(),
                by: requester.to_string(),
            }];
            if let Some(current) = game.current_turn.clone() {
                events.push(ServerMessage::GameTurn {
                    game_id: game.id.clone(),
                    player_id: current,
                });
            }
            self.publish(game_id, &events);
            events
        };
        tracing::info!(game_id, requester, "Game resumed");
        Ok(events)
    }

    /// Host-initiated transfer to a present, connected player.
    pub async fn set_host(
        &self,
        game_id: &str,
        requester: &str,
        new_host: &str,
    ) -> Result<ServerMessage, GameError> {
        let shared = self.session(game_id).await?;
        let msg = {
            let mut game = shared.lock().await;
            if game.status.is_finished() {
                return Err(GameError::conflict("game is over"));
            }
            if game.host_id != requester {
                return Err(GameError::Permission("only the host can transfer host".into()));
            }
            if requester == new_host {
                return Err(GameError::Validation("player is already host".into()));
            }
            let target = game
                .player(new_host)
                .ok_or_else(|| GameError::player_not_found(new_host))?;
            if !target.status.is_present()
                || !self.inner.presence.has_connected_session(game_id, new_host)
            {
                return Err(GameError::conflict("new host is not connected"));
            }
            game.host_id = new_host.to_string();
            game.touch(now_millis());
            self.persist(&game).await;
            let msg = ServerMessage::HostChanged {
                game_id: game.id.clone(),
                previous_host: requester.to_string(),
                new_host: new_host.to_string(),
            };
            self.publish(game_id, std::slice::from_ref(&msg));
            msg
        };
        tracing::info!(game_id, previous = requester, new_host, "Host transferred");
        self.publish_lobby().await;
        Ok(msg)
    }

    /// Update display name and/or token. Token changes also go to the
    /// event queue.
    pub async fn update_player_info(
        &self,
        game_id: &str,
        player_id: &str,
        display_name: Option<String>,
        token: Option<String>,
    ) -> Result<PlayerSummary, GameError> {
        if display_name.is_none() && token.is_none() {
            return Err(GameError::Validation("nothing to update".into()));
        }
        if let Some(name) = &display_name {
            validate_id("display name", name)?;
        }
        if let Some(token) = &token {
            validate_id("token", token)?;
        }

        let shared = self.session(game_id).await?;
        let summary = {
            let mut game = shared.lock().await;
            let host_id = game.host_id.clone();
            let player = game
                .player_mut(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            if let Some(name) = &display_name {
                player.display_name = name.trim().to_string();
            }
            if let Some(token) = &token {
                player.token = Some(token.trim().to_string());
            }
            let connected = self.inner.broadcaster.is_connected(game_id, player_id);
            let summary = PlayerSummary::from_player(player, &host_id, connected);
            game.touch(now_millis());
            self.persist(&game).await;
            self.publish_player(game_id, &summary);
            summary
        };

        if token.is_some() {
            self.enqueue(
                QueuedEventKind::TokenUpdate,
                game_id,
                serde_json::json!({ "player_id": player_id, "token": summary.token }),
            );
        }
        Ok(summary)
    }

    /// Toggle READY/CONNECTED for a lobby player.
    pub async fn set_ready(
        &self,
        game_id: &str,
        player_id: &str,
        ready: bool,
    ) -> Result<PlayerSummary, GameError> {
        let shared = self.session(game_id).await?;
        let summary = {
            let mut game = shared.lock().await;
            if game.status != GameStatus::Lobby {
                return Err(GameError::conflict("game is not in the lobby"));
            }
            let host_id = game.host_id.clone();
            let player = game
                .player_mut(player_id)
                .ok_or_else(|| GameError::player_not_found(player_id))?;
            if !matches!(player.status, PlayerStatus::Connected | PlayerStatus::Ready) {
                return Err(GameError::conflict("player cannot change readiness now"));
            }
            player.status = if ready {
                PlayerStatus::Ready
            } else {
                PlayerStatus::Connected
            };
            let connected = self.inner.broadcaster.is_connected(game_id, player_id);
            let summary = PlayerSummary::from_player(player, &host_id, connected);
            game.touch(now_millis());
            self.persist(&game).await;
            self.publish_player(game_id, &summary);
            summary
        };
        Ok(summary)
    }

    /// Host-only removal, including the stored record.
    pub async fn delete_game(&self, game_id: &str, requester: &str) -> Result<(), GameError> {
        let host_id = self.session(game_id).await?.lock().await.host_id.clone();
        if host_id != requester {
            return Err(GameError::Permission("only the host can delete the game".into()));
        }
        self.cleanup_abandoned_game(game_id, true).await
    }

    /// Drop a session from the registry, optionally delete its stored
    /// record, and tell its clients and lobby watchers.
    pub async fn cleanup_abandoned_game(
        &self,
        game_id: &str,
        delete_from_store: bool,
    ) -> Result<(), GameError> {
        let removed = self.inner.sessions.write().await.remove(game_id);
        let Some(shared) = removed else {
            return Err(GameError::game_not_found(game_id));
        };
        let room_code = shared.lock().await.room_code.clone();
        self.release_room_code(&room_code);
        self.inner.scheduler.cancel_game(game_id);
        self.inner.presence.clear_game(game_id);
        if delete_from_store && let Err(e) = self.inner.store.delete(game_id).await {
            tracing::warn!(game_id, error = %e, "Failed to delete stored game");
        }

        self.inner.broadcaster.broadcast_to_game(
            game_id,
            &ServerMessage::GameDeleted {
                game_id: game_id.to_string(),
            },
        );
        self.inner.broadcaster.close_game(game_id);
        tracing::info!(game_id, delete_from_store, "Game removed");
        self.publish_lobby().await;
        Ok(())
    }

    pub async fn cleanup_stale_games(&self) -> Vec<GameId> {
        self.cleanup_stale_games_at(now_millis()).await
    }

    /// Sweep for idle, empty, unstarted, host-lost and duplicate lobbies as
    /// of `now`. Hosts without a socket are migrated when a successor
    /// exists. Returns the removed game ids.
    pub async fn cleanup_stale_games_at(&self, now: Millis) -> Vec<GameId> {
        let cfg = &self.inner.config;
        let idle = cfg.idle_timeout_secs * SECOND;
        let empty_lobby = cfg.empty_lobby_secs * SECOND;
        let unstarted = cfg.unstarted_lobby_secs * SECOND;
        let host_grace = cfg.host_connect_grace_secs * SECOND;

        let mut doomed: Vec<(GameId, &'static str)> = Vec::new();
        let mut lobbies_by_host: HashMap<PlayerId, Vec<(Millis, GameId)>> = HashMap::new();

        for (id, shared) in self.all_sessions().await {
            let mut game = shared.lock().await;
            let age = elapsed_since(game.created_at, now);
            let in_lobby = game.status == GameStatus::Lobby;

            let reason = if elapsed_since(game.last_activity, now) >= idle {
                Some("idle")
            } else if in_lobby && game.remaining_players().len() <= 1 && age >= empty_lobby {
                Some("empty_lobby")
            } else if in_lobby && age >= unstarted {
                Some("unstarted")
            } else {
                None
            };
            if let Some(reason) = reason {
                doomed.push((id, reason));
                continue;
            }
            if !in_lobby {
                continue;
            }

            let host = game.host_id.clone();
            if age >= host_grace && !self.inner.presence.has_connected_session(&id, &host) {
                match self.find_successor(&game, &host) {
                    Some(next) => {
                        tracing::info!(
                            game_id = %id,
                            previous = %host,
                            new_host = %next,
                            "Migrated host of lobby"
                        );
                        game.host_id = next.clone();
                        self.persist(&game).await;
                        self.publish(
                            &id,
                            &[ServerMessage::HostChanged {
                                game_id: id.clone(),
                                previous_host: host,
                                new_host: next,
                            }],
                        );
                    },
                    None => {
                        doomed.push((id, "host_lost"));
                        continue;
                    },
                }
            }
            lobbies_by_host
                .entry(game.host_id.clone())
                .or_default()
                .push((game.created_at, id));
        }

        for (_, mut games) in lobbies_by_host {
            if games.len() < 2 {
                continue;
            }
            games.sort();
            games.pop();
            doomed.extend(games.into_iter().map(|(_, id)| (id, "duplicate")));
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for (game_id, reason) in doomed {
            tracing::info!(game_id = %game_id, reason, "Removing stale game");
            if self.cleanup_abandoned_game(&game_id, true).await.is_ok() {
                removed.push(game_id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Stale game sweep finished");
        }
        removed
    }

    // ---- reads -----------------------------------------------------------

    /// Hold a session's lock outside the registry. No game event for it
    /// is published while the guard lives.
    pub async fn lock_session(
        &self,
        game_id: &str,
    ) -> Result<OwnedMutexGuard<GameSession>, GameError> {
        Ok(self.session(game_id).await?.lock_owned().await)
    }

    pub async fn snapshot(&self, game_id: &str) -> Result<GameSession, GameError> {
        let shared = self.session(game_id).await?;
        let game = shared.lock().await;
        Ok(game.clone())
    }

    pub async fn contains(&self, game_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(game_id)
    }

    /// The `active_players` roster for a game.
    pub async fn active_players(&self, game_id: &str) -> Result<ServerMessage, GameError> {
        let shared = self.session(game_id).await?;
        let game = shared.lock().await;
        Ok(self.roster(&game))
    }

    /// Joinable games, oldest first.
    pub async fn lobby_listing(&self) -> Vec<LobbyEntry> {
        let mut entries = Vec::new();
        for (_, shared) in self.all_sessions().await {
            let game = shared.lock().await;
            if game.status != GameStatus::Lobby {
                continue;
            }
            entries.push((
                game.created_at,
                LobbyEntry {
                    game_id: game.id.clone(),
                    room_code: game.room_code.clone(),
                    name: game.name.clone(),
                    host_id: game.host_id.clone(),
                    player_count: game.remaining_players().len(),
                    max_players: game.max_players,
                    status: game.status,
                },
            ));
        }
        entries.sort_by(|a, b| (a.0, &a.1.game_id).cmp(&(b.0, &b.1.game_id)));
        entries.into_iter().map(|(_, e)| e).collect()
    }

    pub fn find_by_room_code(&self, code: &str) -> Result<GameId, GameError> {
        let code = code.trim().to_ascii_uppercase();
        if !is_valid_room_code(&code) {
            return Err(GameError::Validation("malformed room code".into()));
        }
        self.inner
            .room_codes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .cloned()
            .ok_or_else(|| GameError::NotFound(format!("room {code}")))
    }

    /// Load ACTIVE and PAUSED games from the store. No socket survives a
    /// restart, so every connection record is marked closed.
    pub async fn rehydrate(&self) -> Result<usize, StoreError> {
        let games = self
            .inner
            .store
            .find_by_status(&[GameStatus::Active, GameStatus::Paused])
            .await?;
        let now = now_millis();
        let mut sessions = self.inner.sessions.write().await;
        let mut loaded = 0;
        for mut game in games {
            if sessions.contains_key(&game.id) {
                continue;
            }
            game.mark_all_connections_closed(now);
            self.inner
                .room_codes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(game.room_code.clone(), game.id.clone());
            sessions.insert(game.id.clone(), Arc::new(Mutex::new(game)));
            loaded += 1;
        }
        tracing::info!(loaded, "Rehydrated in-progress games from store");
        Ok(loaded)
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for (_, shared) in self.all_sessions().await {
            let game = shared.lock().await;
            stats.games += 1;
            stats.players += game.players.len();
            match game.status {
                GameStatus::Lobby => stats.lobby += 1,
                GameStatus::Active => stats.active += 1,
                GameStatus::Paused => stats.paused += 1,
                GameStatus::Completed | GameStatus::Abandoned => stats.finished += 1,
            }
        }
        stats
    }
}
