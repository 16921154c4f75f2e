pub mod error;
pub mod net;
pub mod player;
pub mod rules;
pub mod session;
pub mod time;

pub use error::GameError;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::player::{Player, PlayerStatus};
    use crate::rules::DiceRoller;
    use crate::session::{GameSession, GameStatus};

    /// Dice that replay a fixed script, then fall back to `(1, 2)`.
    #[derive(Debug, Default)]
    pub struct SequenceDice {
        rolls: Mutex<VecDeque<(u8, u8)>>,
    }

    impl SequenceDice {
        pub fn new(rolls: impl IntoIterator<Item = (u8, u8)>) -> Self {
            Self {
                rolls: Mutex::new(rolls.into_iter().collect()),
            }
        }

        pub fn push(&self, roll: (u8, u8)) {
            self.rolls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(roll);
        }
    }

    impl DiceRoller for SequenceDice {
        fn roll(&self) -> (u8, u8) {
            self.rolls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or((1, 2))
        }
    }

    /// A LOBBY session seating `ids` in order; the first id is host.
    pub fn lobby_session(ids: &[&str]) -> GameSession {
        let mut session = GameSession::new(
            "game-1".into(),
            "ABCD-1234".into(),
            "Test".into(),
            ids[0].into(),
            8,
            1500,
            0,
        );
        for id in &ids[1..] {
            session.seat_player(Player::new((*id).into(), 1500, 0));
        }
        session
    }

    /// An ACTIVE session with seats (and turn order) in the given order,
    /// first player to move.
    pub fn active_session(ids: &[&str]) -> GameSession {
        let mut session = lobby_session(ids);
        session.status = GameStatus::Active;
        session.started_at = Some(0);
        for player in session.players.values_mut() {
            player.status = PlayerStatus::Active;
        }
        session.refresh_turn_order();
        session
    }
}
