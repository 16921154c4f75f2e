//! Live membership map and the fan-out surface used by the registry and hub.
//!
//! Structural changes go through the dispatch actor (`insert`/`remove`);
//! fan-out only takes the read lock, so many broadcasts run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use boardroom_core::GameError;
use boardroom_core::net::messages::{Priority, ServerMessage};
use boardroom_core::net::protocol::encode_server_message;
use boardroom_core::player::PlayerId;
use boardroom_core::session::{GameId, SessionId};
use boardroom_core::time::{Millis, elapsed_since};

use crate::pipeline::{EnqueueError, Frame, OutboundQueue, QueueLimits};

/// One live socket bound to a (game, player) pair.
pub struct ClientHandle {
    pub game_id: GameId,
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub connected_at: Millis,
    queue: Arc<OutboundQueue>,
    last_pong: AtomicU64,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("game_id", &self.game_id)
            .field("player_id", &self.player_id)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn new(
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        limits: QueueLimits,
        now: Millis,
    ) -> Self {
        Self {
            game_id,
            player_id,
            session_id,
            connected_at: now,
            queue: Arc::new(OutboundQueue::new(limits)),
            last_pong: AtomicU64::new(now),
        }
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Record liveness (a pong or any inbound frame).
    pub fn record_pong(&self, now: Millis) {
        self.last_pong.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_pong(&self) -> Millis {
        self.last_pong.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Encode and enqueue one message for this client only.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), GameError> {
        let frame =
            encode_frame(msg).ok_or_else(|| GameError::Validation("unencodable event".into()))?;
        self.enqueue(frame, msg.priority())
    }

    pub(crate) fn enqueue(&self, frame: Frame, priority: Priority) -> Result<(), GameError> {
        self.queue.enqueue(frame, priority).map(|_| ()).map_err(|e| match e {
            EnqueueError::Closed => GameError::Connection("client connection closed".into()),
            EnqueueError::Full => {
                GameError::ResourceExhausted("client outbound queues full".into())
            },
        })
    }
}

fn encode_frame(msg: &ServerMessage) -> Option<Frame> {
    match encode_server_message(msg) {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            tracing::error!(error = %e, kind = msg.kind(), "Failed to encode outbound event");
            None
        },
    }
}

#[derive(Default)]
struct Members {
    games: HashMap<GameId, HashMap<PlayerId, Arc<ClientHandle>>>,
    lobby: HashMap<u64, Arc<OutboundQueue>>,
}

#[derive(Default)]
pub struct Broadcaster {
    members: RwLock<Members>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `client`, retiring any live client for the same (game, player).
    /// The retired client's queues are closed before the new one is visible.
    pub(crate) fn insert(&self, client: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let game = members.games.entry(client.game_id.clone()).or_default();
        let previous = game.remove(&client.player_id);
        if let Some(prev) = &previous {
            prev.queue().close();
        }
        game.insert(client.player_id.clone(), client);
        previous
    }

    /// Remove the client only if it is still the registered session.
    pub(crate) fn remove(
        &self,
        game_id: &str,
        player_id: &str,
        session_id: &str,
    ) -> Option<Arc<ClientHandle>> {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let game = members.games.get_mut(game_id)?;
        if game.get(player_id).is_none_or(|c| c.session_id != session_id) {
            return None;
        }
        let removed = game.remove(player_id);
        if game.is_empty() {
            members.games.remove(game_id);
        }
        if let Some(client) = &removed {
            client.queue().close();
        }
        removed
    }

    pub(crate) fn add_lobby_watcher(&self, id: u64, queue: Arc<OutboundQueue>) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.lobby.insert(id, queue);
    }

    pub(crate) fn remove_lobby_watcher(&self, id: u64) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        match members.lobby.remove(&id) {
            Some(queue) => {
                queue.close();
                true
            },
            None => false,
        }
    }

    fn fan_out(
        &self,
        game_id: &str,
        except: Option<&str>,
        frame: &Frame,
        priority: Priority,
    ) -> usize {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let Some(game) = members.games.get(game_id) else {
            return 0;
        };
        let mut delivered = 0;
        for client in game.values() {
            if except.is_some_and(|p| p == client.player_id) {
                continue;
            }
            match client.enqueue(Frame::clone(frame), priority) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    game_id,
                    player_id = %client.player_id,
                    error = %e,
                    "Dropped broadcast"
                ),
            }
        }
        delivered
    }

    /// Deliver `msg` to every client in the game. Returns how many accepted it.
    pub fn broadcast_to_game(&self, game_id: &str, msg: &ServerMessage) -> usize {
        match encode_frame(msg) {
            Some(frame) => self.fan_out(game_id, None, &frame, msg.priority()),
            None => 0,
        }
    }

    pub fn broadcast_to_game_except(
        &self,
        game_id: &str,
        except: &str,
        msg: &ServerMessage,
    ) -> usize {
        match encode_frame(msg) {
            Some(frame) => self.fan_out(game_id, Some(except), &frame, msg.priority()),
            None => 0,
        }
    }

    /// Forward an inbound frame unmodified to the sender's peers at low priority.
    pub fn relay_to_game(&self, game_id: &str, sender: &str, raw: &str) -> usize {
        self.fan_out(game_id, Some(sender), &Frame::from(raw), Priority::Low)
    }

    pub fn send_to_player_with_priority(
        &self,
        game_id: &str,
        player_id: &str,
        msg: &ServerMessage,
        priority: Priority,
    ) -> Result<(), GameError> {
        let client = self
            .client(game_id, player_id)
            .ok_or_else(|| GameError::Connection(format!("player {player_id} is not connected")))?;
        let frame =
            encode_frame(msg).ok_or_else(|| GameError::Validation("unencodable event".into()))?;
        client.enqueue(frame, priority)
    }

    pub fn broadcast_to_lobby(&self, msg: &ServerMessage) -> usize {
        let Some(frame) = encode_frame(msg) else {
            return 0;
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .lobby
            .values()
            .filter(|q| q.enqueue(Frame::clone(&frame), msg.priority()).is_ok())
            .count()
    }

    pub fn client(&self, game_id: &str, player_id: &str) -> Option<Arc<ClientHandle>> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .games
            .get(game_id)
            .and_then(|g| g.get(player_id))
            .map(Arc::clone)
    }

    pub fn is_connected(&self, game_id: &str, player_id: &str) -> bool {
        self.client(game_id, player_id).is_some()
    }

    pub fn connected_players(&self, game_id: &str) -> Vec<PlayerId> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let mut players: Vec<PlayerId> = members
            .games
            .get(game_id)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default();
        players.sort();
        players
    }

    pub fn games_with_clients(&self) -> Vec<GameId> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.games.keys().cloned().collect()
    }

    /// Clients whose last pong is older than `timeout`.
    pub fn stale_clients(&self, now: Millis, timeout: Millis) -> Vec<Arc<ClientHandle>> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .games
            .values()
            .flat_map(|g| g.values())
            .filter(|c| elapsed_since(c.last_pong(), now) >= timeout)
            .map(Arc::clone)
            .collect()
    }

    /// Drop every client of a removed game. Pending frames are flushed
    /// before each socket closes.
    pub fn close_game(&self, game_id: &str) -> usize {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let Some(game) = members.games.remove(game_id) else {
            return 0;
        };
        for client in game.values() {
            client.queue().finish();
        }
        game.len()
    }

    /// Close every queue; used on shutdown.
    pub fn close_all(&self) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        for client in members.games.drain().flat_map(|(_, g)| g.into_values()) {
            client.queue().finish();
        }
        for (_, queue) in members.lobby.drain() {
            queue.finish();
        }
    }

    pub fn client_count(&self) -> usize {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.games.values().map(HashMap::len).sum()
    }

    pub fn lobby_watcher_count(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).lobby.len()
    }
}
