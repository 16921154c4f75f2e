//! Inbound frame dispatch. Each decoded message either answers from the
//! hub's cached view or delegates to the registry; failures go back to the
//! sender as an `error` event and never touch game state.

use std::sync::Arc;

use boardroom_core::GameError;
use boardroom_core::net::messages::{ClientMessage, ServerMessage};
use boardroom_core::net::protocol::decode_client_message;
use boardroom_core::rules::ActionKind;
use boardroom_core::time::now_millis;

use super::Hub;
use super::broadcast::ClientHandle;

/// What the socket task should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

impl Hub {
    pub async fn handle_message(&self, client: &Arc<ClientHandle>, text: &str) -> Flow {
        let now = now_millis();
        client.record_pong(now);
        self.presence()
            .touch(&client.game_id, &client.player_id, &client.session_id, now);

        let msg = match decode_client_message(text, self.inner.max_message_size) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    game_id = %client.game_id,
                    player_id = %client.player_id,
                    error = %e,
                    "Rejected inbound frame"
                );
                self.reply_error(client, &GameError::from(e));
                return Flow::Continue;
            },
        };

        match self.dispatch(client, msg).await {
            Ok(flow) => flow,
            Err(e) => {
                tracing::debug!(
                    game_id = %client.game_id,
                    player_id = %client.player_id,
                    code = e.code(),
                    error = %e,
                    "Message rejected"
                );
                self.reply_error(client, &e);
                Flow::Continue
            },
        }
    }

    async fn dispatch(
        &self,
        client: &Arc<ClientHandle>,
        msg: ClientMessage,
    ) -> Result<Flow, GameError> {
        let game_id = client.game_id.as_str();
        let player_id = client.player_id.as_str();
        let registry = self.registry();

        match msg {
            ClientMessage::VerifyHost => {
                let view = self.view_or_refresh(game_id).await?;
                client.send(&ServerMessage::HostVerification {
                    game_id: game_id.to_string(),
                    player_id: player_id.to_string(),
                    is_host: view.host_id == player_id,
                })?;
            },
            ClientMessage::StartGame => {
                registry.start_game(game_id, player_id).await?;
                self.announce_roster(game_id).await;
            },
            ClientMessage::PlayerJoined { display_name, token } => {
                if display_name.is_some() || token.is_some() {
                    registry
                        .update_player_info(game_id, player_id, display_name, token)
                        .await?;
                }
                self.announce_roster(game_id).await;
            },
            ClientMessage::GetActivePlayers => {
                let view = self.view_or_refresh(game_id).await?;
                client.send(&view.active_players(game_id))?;
            },
            ClientMessage::RollDice => {
                registry
                    .process_action(game_id, player_id, ActionKind::RollDice)
                    .await?;
            },
            ClientMessage::GameAction { action } => {
                registry.process_action(game_id, player_id, action).await?;
            },
            ClientMessage::UpdatePlayerInfo { display_name, token } => {
                registry
                    .update_player_info(game_id, player_id, display_name, token)
                    .await?;
                self.refresh_view(game_id).await;
            },
            ClientMessage::SetPlayerToken { token } => {
                registry
                    .update_player_info(game_id, player_id, None, Some(token))
                    .await?;
                self.refresh_view(game_id).await;
            },
            ClientMessage::PlayerReady { ready } => {
                registry.set_ready(game_id, player_id, ready).await?;
                self.refresh_view(game_id).await;
            },
            ClientMessage::GetGameState => {
                let game = registry.snapshot(game_id).await?;
                client.send(&ServerMessage::CompleteStateSync {
                    game: Box::new(game),
                })?;
            },
            ClientMessage::SetHost { new_host_id } => {
                registry.set_host(game_id, player_id, &new_host_id).await?;
                self.announce_roster(game_id).await;
            },
            ClientMessage::LeaveGame => {
                self.disconnect(client, "leave_game").await;
                return Ok(Flow::Close);
            },
            ClientMessage::Unrecognized { kind, raw } => {
                if !self.config().relay_unknown_messages {
                    return Err(GameError::Validation(format!("unsupported message type `{kind}`")));
                }
                let delivered = self.broadcaster().relay_to_game(game_id, player_id, &raw);
                tracing::debug!(
                    game_id,
                    player_id,
                    kind = %kind,
                    delivered,
                    "Relayed unrecognized message"
                );
            },
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{drain, harness, kinds};
    use boardroom_core::session::GameStatus;

    #[tokio::test]
    async fn verify_host_answers_from_view() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        h.hub.registry().join_game(&id, "p2").await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();
        drain(&p2);

        let flow = h.hub.handle_message(&p2, r#"{"type":"verify_host"}"#).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            drain(&p2),
            vec![ServerMessage::HostVerification {
                game_id: id.clone(),
                player_id: "p2".into(),
                is_host: false,
            }]
        );
        drain(&host);
        h.hub.handle_message(&host, r#"{"type":"verify_host"}"#).await;
        assert!(matches!(
            drain(&host)[0],
            ServerMessage::HostVerification { is_host: true, .. }
        ));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn start_and_roll_flow_through_registry() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        h.hub.registry().join_game(&id, "p2").await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();
        drain(&host);
        drain(&p2);

        h.hub.handle_message(&p2, r#"{"type":"game:start"}"#).await;
        match &drain(&p2)[..] {
            [ServerMessage::Error { code, .. }] => assert_eq!(code, "permission_denied"),
            other => panic!("unexpected {other:?}"),
        }

        h.hub.handle_message(&host, r#"{"type":"game:start"}"#).await;
        let seen = kinds(&drain(&p2));
        assert_eq!(&seen[..2], &["game_started", "game_turn"]);
        assert_eq!(h.hub.view(&id).unwrap().status, GameStatus::Active);

        let current = h.hub.registry().snapshot(&id).await.unwrap().current_turn.unwrap();
        let (mover, waiter) = if current == "host1" { (&host, &p2) } else { (&p2, &host) };
        drain(waiter);
        h.hub.handle_message(waiter, r#"{"type":"roll_dice"}"#).await;
        match &drain(waiter)[..] {
            [ServerMessage::Error { code, message }] => {
                assert_eq!(code, "state_conflict");
                assert_eq!(message, "not your turn");
            },
            other => panic!("unexpected {other:?}"),
        }
        h.hub.handle_message(mover, r#"{"type":"roll_dice"}"#).await;
        assert!(kinds(&drain(waiter)).contains(&"dice_rolled"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_types_are_relayed_to_peers() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        h.hub.registry().join_game(&id, "p2").await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();
        drain(&host);
        drain(&p2);

        let raw = r#"{"type":"chat","text":"hi"}"#;
        h.hub.handle_message(&host, raw).await;
        let relayed = p2.queue().drain_pending();
        assert_eq!(relayed.len(), 1);
        assert_eq!(&*relayed[0], raw);
        assert!(host.queue().drain_pending().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_frames_get_error_events() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        let host = h.hub.connect(&id, "host1", None).await.unwrap();
        drain(&host);

        h.hub.handle_message(&host, "not json").await;
        h.hub.handle_message(&host, r#"{"type":"set_host"}"#).await;
        let errors = drain(&host);
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|m| matches!(m, ServerMessage::Error { code, .. } if code == "validation")));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn leave_game_closes_and_disconnects() {
        let h = harness();
        let id = h.hub.registry().create_game("host1", "Test", 4).await.unwrap();
        h.hub.registry().join_game(&id, "p2").await.unwrap();
        let _host = h.hub.connect(&id, "host1", None).await.unwrap();
        let p2 = h.hub.connect(&id, "p2", None).await.unwrap();

        let flow = h.hub.handle_message(&p2, r#"{"type":"leave_game"}"#).await;
        assert_eq!(flow, Flow::Close);
        assert!(p2.is_closed());
        assert!(!h.hub.broadcaster().is_connected(&id, "p2"));
        h.shutdown.cancel();
    }
}
