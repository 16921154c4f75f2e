use serde::{Deserialize, Serialize};

use crate::time::Millis;

/// Opaque player identifier supplied by the (already authenticated) caller.
pub type PlayerId = String;

/// Maximum length accepted for player ids, display names, and tokens.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Connection/participation status of a seated player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    /// Taking turns in a running game.
    Active,
    /// Socket lost; seat kept for the reconnection grace window.
    Disconnected,
    /// Out of the game (grace expired or bankrupt).
    Forfeited,
    /// Seated in a lobby and marked ready.
    Ready,
    /// Seated in a lobby, not yet ready.
    Connected,
}

impl PlayerStatus {
    /// Seated and reachable: eligible for host succession.
    pub fn is_present(self) -> bool {
        matches!(self, Self::Active | Self::Ready | Self::Connected)
    }
}

/// A seated player. Fields below `status` are owned by the rule collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    #[serde(default)]
    pub token: Option<String>,
    pub status: PlayerStatus,
    #[serde(default)]
    pub disconnected_at: Option<Millis>,
    pub joined_at: Millis,
    pub balance: i64,
    pub position: u8,
    #[serde(default)]
    pub in_jail: bool,
    #[serde(default)]
    pub jail_turns: u8,
    #[serde(default)]
    pub doubles_streak: u8,
    #[serde(default)]
    pub bankrupt: bool,
}

impl Player {
    pub fn new(id: PlayerId, starting_balance: i64, now: Millis) -> Self {
        Self {
            display_name: id.clone(),
            id,
            token: None,
            status: PlayerStatus::Connected,
            disconnected_at: None,
            joined_at: now,
            balance: starting_balance,
            position: 0,
            in_jail: false,
            jail_turns: 0,
            doubles_streak: 0,
            bankrupt: false,
        }
    }

    pub fn is_forfeited(&self) -> bool {
        self.status == PlayerStatus::Forfeited
    }

    /// Clear per-game fields ahead of a fresh start from the lobby.
    pub fn reset_for_lobby(&mut self, starting_balance: i64) {
        self.balance = starting_balance;
        self.position = 0;
        self.in_jail = false;
        self.jail_turns = 0;
        self.doubles_streak = 0;
        self.bankrupt = false;
        self.status = match self.status {
            PlayerStatus::Disconnected => PlayerStatus::Disconnected,
            _ => PlayerStatus::Connected,
        };
    }
}

/// Validate a caller-supplied identifier or display string: non-empty after
/// trimming, bounded length, no control characters.
pub fn is_valid_identifier(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty()
        && trimmed.len() <= MAX_IDENTIFIER_LEN
        && !trimmed.chars().any(|c| c.is_control())
}
