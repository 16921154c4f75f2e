use serde::{Deserialize, Serialize};

use crate::player::{Player, PlayerId, PlayerStatus};
use crate::rules::ActionKind;
use crate::session::{GameId, GameSession, GameStatus, SessionId, TradeOffer};

/// Delivery tier for outbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Chat, cosmetic relays.
    Low,
    /// Presence and status updates.
    Normal,
    /// Turn and game-state events.
    High,
}

impl Priority {
    /// The next tier up, used when a queue is full.
    pub fn escalate(self) -> Option<Priority> {
        match self {
            Self::Low => Some(Self::Normal),
            Self::Normal => Some(Self::High),
            Self::High => None,
        }
    }
}

fn default_ready() -> bool {
    true
}

/// Inbound WebSocket messages, discriminated by the JSON `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "verify_host")]
    VerifyHost,
    #[serde(rename = "game:start")]
    StartGame,
    #[serde(rename = "player_joined")]
    PlayerJoined {
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "get_active_players")]
    GetActivePlayers,
    #[serde(rename = "roll_dice")]
    RollDice,
    #[serde(rename = "game_action")]
    GameAction { action: ActionKind },
    #[serde(rename = "update_player_info", alias = "update_player")]
    UpdatePlayerInfo {
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "set_player_token")]
    SetPlayerToken { token: String },
    #[serde(rename = "player_ready")]
    PlayerReady {
        #[serde(default = "default_ready")]
        ready: bool,
    },
    #[serde(rename = "get_game_state")]
    GetGameState,
    #[serde(rename = "set_host")]
    SetHost { new_host_id: PlayerId },
    #[serde(rename = "leave_game")]
    LeaveGame,
    /// Any other `type`. Carries the original frame so it can be relayed
    /// to peers unmodified.
    #[serde(skip)]
    Unrecognized { kind: String, raw: String },
}

/// `type` values decoded into a typed [`ClientMessage`] variant.
pub const KNOWN_CLIENT_TYPES: &[&str] = &[
    "verify_host",
    "game:start",
    "player_joined",
    "get_active_players",
    "roll_dice",
    "game_action",
    "update_player_info",
    "update_player",
    "set_player_token",
    "player_ready",
    "get_game_state",
    "set_host",
    "leave_game",
];

/// Public view of a seated player as presented to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub id: PlayerId,
    pub display_name: String,
    pub token: Option<String>,
    pub status: PlayerStatus,
    pub is_host: bool,
    pub connected: bool,
}

impl PlayerSummary {
    pub fn from_player(player: &Player, host_id: &str, connected: bool) -> Self {
        Self {
            id: player.id.clone(),
            display_name: player.display_name.clone(),
            token: player.token.clone(),
            status: player.status,
            is_host: player.id == host_id,
            connected,
        }
    }
}

/// One row of the lobby listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyEntry {
    pub game_id: GameId,
    pub room_code: String,
    pub name: String,
    pub host_id: PlayerId,
    pub player_count: usize,
    pub max_players: u8,
    pub status: GameStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JailEventKind {
    SentToJail,
    StillJailed,
    Released,
}

/// Outbound events, discriminated by the JSON `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ActivePlayers {
        game_id: GameId,
        host_id: PlayerId,
        players: Vec<PlayerSummary>,
    },
    HostChanged {
        game_id: GameId,
        previous_host: PlayerId,
        new_host: PlayerId,
    },
    HostVerification {
        game_id: GameId,
        player_id: PlayerId,
        is_host: bool,
    },
    GameStarted {
        game_id: GameId,
        turn_order: Vec<PlayerId>,
        current_turn: PlayerId,
    },
    GameTurn {
        game_id: GameId,
        player_id: PlayerId,
    },
    TurnChanged {
        game_id: GameId,
        previous: Option<PlayerId>,
        current: PlayerId,
    },
    JailEvent {
        game_id: GameId,
        player_id: PlayerId,
        event: JailEventKind,
        jail_turns: u8,
    },
    DiceRolled {
        game_id: GameId,
        player_id: PlayerId,
        dice: [u8; 2],
        total: u8,
        doubles: bool,
        position: u8,
    },
    CompleteStateSync {
        game: Box<GameSession>,
    },
    PlayerUpdated {
        game_id: GameId,
        player: PlayerSummary,
    },
    ReconnectionSuccessful {
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        previous_session_id: SessionId,
    },
    PlayerReconnected {
        game_id: GameId,
        player_id: PlayerId,
    },
    GameDeleted {
        game_id: GameId,
    },
    LobbyUpdate {
        games: Vec<LobbyEntry>,
    },
    Error {
        code: String,
        message: String,
    },
    GameOver {
        game_id: GameId,
        winner: Option<PlayerId>,
    },
    PropertyUpdated {
        game_id: GameId,
        position: u8,
        owner: Option<PlayerId>,
        mortgaged: bool,
        houses: u8,
    },
    TradeProposed {
        game_id: GameId,
        trade: TradeOffer,
    },
    GamePaused {
        game_id: GameId,
        by: PlayerId,
    },
    GameResumed {
        game_id: GameId,
        by: PlayerId,
    },
}

impl ServerMessage {
    /// Delivery tier of this event.
    pub fn priority(&self) -> Priority {
        match self {
            Self::ActivePlayers { .. }
            | Self::HostVerification { .. }
            | Self::PlayerUpdated { .. }
            | Self::PlayerReconnected { .. }
            | Self::LobbyUpdate { .. }
            | Self::TradeProposed { .. } => Priority::Normal,
            _ => Priority::High,
        }
    }

    pub fn error(err: &crate::error::GameError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ActivePlayers { .. } => "active_players",
            Self::HostChanged { .. } => "host_changed",
            Self::HostVerification { .. } => "host_verification",
            Self::GameStarted { .. } => "game_started",
            Self::GameTurn { .. } => "game_turn",
            Self::TurnChanged { .. } => "turn_changed",
            Self::JailEvent { .. } => "jail_event",
            Self::DiceRolled { .. } => "dice_rolled",
            Self::CompleteStateSync { .. } => "complete_state_sync",
            Self::PlayerUpdated { .. } => "player_updated",
            Self::ReconnectionSuccessful { .. } => "reconnection_successful",
            Self::PlayerReconnected { .. } => "player_reconnected",
            Self::GameDeleted { .. } => "game_deleted",
            Self::LobbyUpdate { .. } => "lobby_update",
            Self::Error { .. } => "error",
            Self::GameOver { .. } => "game_over",
            Self::PropertyUpdated { .. } => "property_updated",
            Self::TradeProposed { .. } => "trade_proposed",
            Self::GamePaused { .. } => "game_paused",
            Self::GameResumed { .. } => "game_resumed",
        }
    }
}
