use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::player::{Player, PlayerId, PlayerStatus};
use crate::time::Millis;

/// Game identifier (UUID string generated by the server).
pub type GameId = String;

/// Per-socket connection identifier, distinct from game and player identity.
pub type SessionId = String;

/// Lifecycle state of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Lobby,
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl GameStatus {
    /// Running games: loaded back from the store on startup.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

/// One socket-level attachment of a player to a game. Entries are only
/// appended or flipped to disconnected, never removed while the session lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConnection {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub is_connected: bool,
    pub connected_at: Millis,
    #[serde(default)]
    pub disconnected_at: Option<Millis>,
}

/// Ownership record for a purchasable square.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyState {
    pub owner: PlayerId,
    #[serde(default)]
    pub mortgaged: bool,
    #[serde(default)]
    pub houses: u8,
}

/// A landing on an unowned square the lander may still buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPurchase {
    pub player_id: PlayerId,
    pub position: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeOffer {
    pub id: u64,
    pub from: PlayerId,
    pub to: PlayerId,
    #[serde(default)]
    pub offer_cash: i64,
    #[serde(default)]
    pub offer_properties: Vec<u8>,
    #[serde(default)]
    pub request_cash: i64,
    #[serde(default)]
    pub request_properties: Vec<u8>,
}

/// Board sub-state owned by the rules module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardState {
    #[serde(default)]
    pub properties: BTreeMap<u8, PropertyState>,
    #[serde(default)]
    pub pending_purchase: Option<PendingPurchase>,
    #[serde(default)]
    pub trades: Vec<TradeOffer>,
    #[serde(default)]
    pub next_trade_id: u64,
}

impl BoardState {
    /// Return every property owned by `player_id` to the bank and drop any
    /// pending purchase or open trade that references them.
    pub fn release_player(&mut self, player_id: &str) -> Vec<u8> {
        let released: Vec<u8> = self
            .properties
            .iter()
            .filter(|(_, p)| p.owner == player_id)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in &released {
            self.properties.remove(pos);
        }
        if self
            .pending_purchase
            .as_ref()
            .is_some_and(|p| p.player_id == player_id)
        {
            self.pending_purchase = None;
        }
        self.trades.retain(|t| t.from != player_id && t.to != player_id);
        released
    }
}

/// Authoritative state of one game.
///
/// `seats` is the stable seating order (join order in the lobby, shuffled once
/// at start). `turn_order` is always derived from it by
/// [`GameSession::refresh_turn_order`], so a disconnected player keeps their
/// seat while dropping out of the rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: GameId,
    pub room_code: String,
    pub name: String,
    pub status: GameStatus,
    pub seats: Vec<PlayerId>,
    pub turn_order: Vec<PlayerId>,
    pub current_turn: Option<PlayerId>,
    pub host_id: PlayerId,
    pub players: BTreeMap<PlayerId, Player>,
    #[serde(default)]
    pub connections: Vec<PlayerConnection>,
    pub max_players: u8,
    pub created_at: Millis,
    #[serde(default)]
    pub started_at: Option<Millis>,
    pub last_activity: Millis,
    #[serde(default)]
    pub board: BoardState,
    /// Set when the session paused itself because no ACTIVE player was
    /// left; the first reconnection resumes it.
    #[serde(default)]
    pub auto_paused: bool,
}

impl GameSession {
    /// A fresh LOBBY session with the host seated as the only player.
    pub fn new(
        id: GameId,
        room_code: String,
        name: String,
        host_id: PlayerId,
        max_players: u8,
        starting_balance: i64,
        now: Millis,
    ) -> Self {
        let mut players = BTreeMap::new();
        players.insert(
            host_id.clone(),
            Player::new(host_id.clone(), starting_balance, now),
        );
        let mut session = Self {
            id,
            room_code,
            name,
            status: GameStatus::Lobby,
            seats: vec![host_id.clone()],
            turn_order: Vec::new(),
            current_turn: None,
            host_id,
            players,
            connections: Vec::new(),
            max_players,
            created_at: now,
            started_at: None,
            last_activity: now,
            board: BoardState::default(),
            auto_paused: false,
        };
        session.refresh_turn_order();
        session
    }

    pub fn player(&self, player_id: &str) -> Option<&Player> {
        self.players.get(player_id)
    }

    pub fn player_mut(&mut self, player_id: &str) -> Option<&mut Player> {
        self.players.get_mut(player_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players as usize
    }

    pub fn touch(&mut self, now: Millis) {
        self.last_activity = now;
    }

    /// Seat a new player at the end of the seating order.
    pub fn seat_player(&mut self, player: Player) {
        self.seats.push(player.id.clone());
        self.players.insert(player.id.clone(), player);
        self.refresh_turn_order();
    }

    /// Players that have not been knocked out of the game.
    pub fn remaining_players(&self) -> Vec<PlayerId> {
        self.seats
            .iter()
            .filter(|id| self.players.get(*id).is_some_and(|p| !p.is_forfeited()))
            .cloned()
            .collect()
    }

    pub fn active_players(&self) -> Vec<PlayerId> {
        self.seats
            .iter()
            .filter(|id| {
                self.players
                    .get(*id)
                    .is_some_and(|p| p.status == PlayerStatus::Active)
            })
            .cloned()
            .collect()
    }

    /// Recompute `turn_order` from `seats` and repair `current_turn` when the
    /// current player dropped out of the rotation.
    pub fn refresh_turn_order(&mut self) {
        self.turn_order = match self.status {
            GameStatus::Lobby => self.remaining_players(),
            _ => self.active_players(),
        };

        match self.status {
            GameStatus::Lobby => self.current_turn = None,
            GameStatus::Active => {
                let still_valid = self
                    .current_turn
                    .as_ref()
                    .is_some_and(|c| self.turn_order.contains(c));
                if !still_valid {
                    self.current_turn = match self.current_turn.clone() {
                        Some(prev) => self.next_active_after(&prev),
                        None => self.turn_order.first().cloned(),
                    };
                }
            },
            _ => {},
        }
    }

    /// The first ACTIVE player seated after `player_id`, wrapping around.
    /// `player_id` itself is the last candidate considered.
    pub fn next_active_after(&self, player_id: &str) -> Option<PlayerId> {
        let len = self.seats.len();
        if len == 0 {
            return None;
        }
        let start = self.seats.iter().position(|s| s == player_id).unwrap_or(len - 1);
        (1..=len)
            .map(|k| &self.seats[(start + k) % len])
            .find(|id| {
                self.players
                    .get(*id)
                    .is_some_and(|p| p.status == PlayerStatus::Active)
            })
            .cloned()
    }

    /// Move the turn to the next ACTIVE seat. Returns `(previous, current)`.
    pub fn advance_turn(&mut self) -> (Option<PlayerId>, Option<PlayerId>) {
        let previous = self.current_turn.clone();
        self.current_turn = match &previous {
            Some(prev) => self.next_active_after(prev),
            None => self.turn_order.first().cloned(),
        };
        if let Some(p) = previous.as_ref().and_then(|id| self.players.get_mut(id)) {
            p.doubles_streak = 0;
        }
        (previous, self.current_turn.clone())
    }

    pub fn add_connection(&mut self, player_id: &str, session_id: SessionId, now: Millis) {
        self.connections.push(PlayerConnection {
            player_id: player_id.to_string(),
            session_id,
            is_connected: true,
            connected_at: now,
            disconnected_at: None,
        });
    }

    /// Flip every live connection entry of `player_id` to disconnected.
    pub fn mark_connections_closed(&mut self, player_id: &str, now: Millis) {
        for conn in self
            .connections
            .iter_mut()
            .filter(|c| c.player_id == player_id && c.is_connected)
        {
            conn.is_connected = false;
            conn.disconnected_at = Some(now);
        }
    }

    pub fn mark_all_connections_closed(&mut self, now: Millis) {
        for conn in self.connections.iter_mut().filter(|c| c.is_connected) {
            conn.is_connected = false;
            conn.disconnected_at = Some(now);
        }
    }

    pub fn has_live_connection(&self, player_id: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.player_id == player_id && c.is_connected)
    }

    /// Check the structural invariants. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for id in &self.seats {
            if !seen.insert(id) {
                return Err(format!("player {id} seated twice"));
            }
            if !self.players.contains_key(id) {
                return Err(format!("seat {id} has no player record"));
            }
        }
        if seen.len() != self.players.len() {
            return Err("player without a seat".into());
        }

        if self.status == GameStatus::Active {
            let active: HashSet<&PlayerId> = self
                .players
                .values()
                .filter(|p| p.status == PlayerStatus::Active)
                .map(|p| &p.id)
                .collect();
            let order: HashSet<&PlayerId> = self.turn_order.iter().collect();
            if order.len() != self.turn_order.len() || order != active {
                return Err("turn order is not a permutation of active players".into());
            }
            match &self.current_turn {
                Some(c) if order.contains(c) => {},
                other => return Err(format!("current turn {other:?} not in turn order")),
            }
        }

        if self.status != GameStatus::Abandoned && !self.players.contains_key(&self.host_id) {
            return Err(format!("host {} is not a player", self.host_id));
        }
        Ok(())
    }
}

// Letters exclude I and O so codes read unambiguously aloud.
const ROOM_CODE_LETTERS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Generate a human-readable room code in the form `ABCD-1234`.
pub fn generate_room_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(9);
    for _ in 0..4 {
        let idx = rng.random_range(0..ROOM_CODE_LETTERS.len());
        code.push(ROOM_CODE_LETTERS[idx] as char);
    }
    code.push('-');
    for _ in 0..4 {
        code.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    code
}

pub fn is_valid_room_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 9
        && bytes[..4].iter().all(|b| ROOM_CODE_LETTERS.contains(b))
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}
