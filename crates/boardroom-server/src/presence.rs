//! Per (game, player) connection history.
//!
//! Memory only and rebuilt from nothing on restart. Used to classify new
//! sockets as reconnections and to check host-succession eligibility; it is
//! never a source of game truth.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use boardroom_core::player::PlayerId;
use boardroom_core::session::{GameId, SessionId};
use boardroom_core::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connected,
    Disconnected,
    /// Socket gone while the seat is held for the reconnection grace window.
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub connected_at: Millis,
    pub disconnected_at: Option<Millis>,
    pub last_activity: Millis,
    pub status: SessionStatus,
}

type Key = (GameId, PlayerId);

#[derive(Default)]
pub struct PresenceTracker {
    sessions: Mutex<HashMap<Key, Vec<SessionInfo>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<R>(
        &self,
        game_id: &str,
        player_id: &str,
        f: impl FnOnce(&mut Vec<SessionInfo>) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let log = sessions
            .entry((game_id.to_string(), player_id.to_string()))
            .or_default();
        f(log)
    }

    fn read_log<R>(
        &self,
        game_id: &str,
        player_id: &str,
        f: impl FnOnce(&[SessionInfo]) -> R,
    ) -> R {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let key = (game_id.to_string(), player_id.to_string());
        f(sessions.get(&key).map_or(&[][..], Vec::as_slice))
    }

    /// Append a CONNECTED entry. Older entries still marked CONNECTED are
    /// superseded and flipped to DISCONNECTED.
    pub fn record_session(&self, game_id: &str, player_id: &str, session_id: &str, now: Millis) {
        self.with_log(game_id, player_id, |log| {
            for prior in log.iter_mut().filter(|s| s.status == SessionStatus::Connected) {
                prior.status = SessionStatus::Disconnected;
                prior.disconnected_at = Some(now);
            }
            log.push(SessionInfo {
                session_id: session_id.to_string(),
                connected_at: now,
                disconnected_at: None,
                last_activity: now,
                status: SessionStatus::Connected,
            });
        });
    }

    /// Set the status of one session. Returns false if the session is unknown.
    pub fn update_status(
        &self,
        game_id: &str,
        player_id: &str,
        session_id: &str,
        status: SessionStatus,
        now: Millis,
    ) -> bool {
        self.with_log(game_id, player_id, |log| {
            let Some(entry) = log.iter_mut().find(|s| s.session_id == session_id) else {
                return false;
            };
            entry.status = status;
            entry.last_activity = now;
            if status == SessionStatus::Connected {
                entry.disconnected_at = None;
            } else if entry.disconnected_at.is_none() {
                entry.disconnected_at = Some(now);
            }
            true
        })
    }

    /// Flip every non-CONNECTED entry of a player to `status`; used when the
    /// reconnection grace window closes.
    pub fn settle_player(&self, game_id: &str, player_id: &str, status: SessionStatus) {
        self.with_log(game_id, player_id, |log| {
            for entry in log.iter_mut().filter(|s| s.status != SessionStatus::Connected) {
                entry.status = status;
            }
        });
    }

    pub fn touch(&self, game_id: &str, player_id: &str, session_id: &str, now: Millis) {
        self.with_log(game_id, player_id, |log| {
            if let Some(entry) = log.iter_mut().find(|s| s.session_id == session_id) {
                entry.last_activity = now;
            }
        });
    }

    pub fn sessions(&self, game_id: &str, player_id: &str) -> Vec<SessionInfo> {
        self.read_log(game_id, player_id, <[SessionInfo]>::to_vec)
    }

    /// The entry with the latest connect time; later entries win ties.
    pub fn latest_session(&self, game_id: &str, player_id: &str) -> Option<SessionInfo> {
        self.read_log(game_id, player_id, |log| {
            log.iter()
                .enumerate()
                .max_by_key(|(idx, s)| (s.connected_at, *idx))
                .map(|(_, s)| s.clone())
        })
    }

    /// The first entry still CONNECTED.
    pub fn active_session(&self, game_id: &str, player_id: &str) -> Option<SessionInfo> {
        self.read_log(game_id, player_id, |log| {
            log.iter()
                .find(|s| s.status == SessionStatus::Connected)
                .cloned()
        })
    }

    pub fn has_connected_session(&self, game_id: &str, player_id: &str) -> bool {
        self.active_session(game_id, player_id).is_some()
    }

    /// Drop all history for a game.
    pub fn clear_game(&self, game_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|(g, _), _| g != game_id);
    }

    pub fn tracked_players(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_classify() {
        let p = PresenceTracker::new();
        assert!(p.latest_session("g", "a").is_none());
        p.record_session("g", "a", "s1", 10);
        assert_eq!(p.latest_session("g", "a").unwrap().session_id, "s1");
        assert!(p.has_connected_session("g", "a"));

        p.record_session("g", "a", "s2", 20);
        let all = p.sessions("g", "a");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, SessionStatus::Disconnected);
        assert_eq!(all[0].disconnected_at, Some(20));
        assert_eq!(p.active_session("g", "a").unwrap().session_id, "s2");
    }

    #[test]
    fn latest_prefers_later_entry_on_tie() {
        let p = PresenceTracker::new();
        p.record_session("g", "a", "s1", 10);
        p.record_session("g", "a", "s2", 10);
        assert_eq!(p.latest_session("g", "a").unwrap().session_id, "s2");
    }

    #[test]
    fn update_status_and_settle() {
        let p = PresenceTracker::new();
        p.record_session("g", "a", "s1", 10);
        assert!(p.update_status("g", "a", "s1", SessionStatus::Reconnecting, 15));
        assert!(!p.has_connected_session("g", "a"));
        assert!(!p.update_status("g", "a", "nope", SessionStatus::Connected, 15));

        p.settle_player("g", "a", SessionStatus::Disconnected);
        let s = p.latest_session("g", "a").unwrap();
        assert_eq!(s.status, SessionStatus::Disconnected);
        assert_eq!(s.disconnected_at, Some(15));
    }

    #[test]
    fn clear_game_only_touches_that_game() {
        let p = PresenceTracker::new();
        p.record_session("g1", "a", "s1", 1);
        p.record_session("g2", "a", "s2", 1);
        p.clear_game("g1");
        assert!(p.latest_session("g1", "a").is_none());
        assert!(p.latest_session("g2", "a").is_some());
    }
}
