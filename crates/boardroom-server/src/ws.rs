use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use futures::stream::SplitStream;
use serde::Deserialize;

use boardroom_core::GameError;
use boardroom_core::net::messages::ServerMessage;
use boardroom_core::net::protocol::encode_server_message;
use boardroom_core::player::PlayerId;
use boardroom_core::session::{GameId, SessionId};
use boardroom_core::time::now_millis;

use crate::error::AppError;
use crate::hub::Hub;
use crate::hub::broadcast::ClientHandle;
use crate::hub::handler::Flow;
use crate::pipeline::{WriterOptions, run_writer};
use crate::state::{AppState, ConnectionGuard};

/// Query string of `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub game_id: GameId,
    pub player_id: PlayerId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

fn check_capacity(state: &AppState) -> Result<ConnectionGuard, AppError> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(
            GameError::ResourceExhausted("websocket connection limit reached".into()).into(),
        );
    }
    Ok(ConnectionGuard::new(Arc::clone(&state.ws_connection_count)))
}

/// `GET /ws?game_id=&player_id=&session_id=`. The player must already be
/// seated in the game; the upgrade is refused otherwise.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let game = state.registry.snapshot(&params.game_id).await?;
    if game.player(&params.player_id).is_none() {
        return Err(GameError::player_not_found(&params.player_id).into());
    }
    let guard = check_capacity(&state)?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, params, guard))
        .into_response())
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    params: ConnectParams,
    _guard: ConnectionGuard,
) {
    let client = match state
        .hub
        .connect(&params.game_id, &params.player_id, params.session_id)
        .await
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(
                game_id = %params.game_id,
                player_id = %params.player_id,
                error = %e,
                "Connection refused"
            );
            if let Ok(text) = encode_server_message(&ServerMessage::error(&e)) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        },
    };

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(
        sink,
        Arc::clone(client.queue()),
        WriterOptions::from(&state.config.hub),
        state.shutdown.child_token(),
    ));

    let limits = &state.config.limits;
    let mut limiter = RateLimiter::new(limits.ws_rate_limit_per_sec, limits.ws_rate_limit_per_sec);
    let reader = read_loop(&mut stream, &state.hub, &client, &mut limiter, limits.max_message_size);
    tokio::select! {
        _ = reader => {},
        _ = &mut writer => {},
    }

    // Closing the client's queue ends the writer task.
    state.hub.disconnect(&client, "socket closed").await;
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    hub: &Hub,
    client: &Arc<ClientHandle>,
    limiter: &mut RateLimiter,
    max_size: usize,
) {
    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Pong(_) => {
                client.record_pong(now_millis());
                continue;
            },
            Message::Close(_) => break,
            _ => continue,
        };

        if !limiter.allow() {
            tracing::warn!(
                game_id = %client.game_id,
                player_id = %client.player_id,
                "Rate limited"
            );
            continue;
        }
        if text.as_str().len() > max_size {
            tracing::warn!(
                game_id = %client.game_id,
                player_id = %client.player_id,
                size = text.as_str().len(),
                "Dropped oversized frame"
            );
            continue;
        }

        if hub.handle_message(client, text.as_str()).await == Flow::Close {
            break;
        }
    }
}

/// `GET /ws/lobby`: a read-only socket fed `lobby_update` events.
pub async fn lobby_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let guard = check_capacity(&state)?;
    Ok(ws
        .on_upgrade(move |socket| handle_lobby_socket(socket, state, guard))
        .into_response())
}

async fn handle_lobby_socket(socket: WebSocket, state: AppState, _guard: ConnectionGuard) {
    let (watcher, queue) = match state.hub.watch_lobby().await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Lobby watch refused");
            return;
        },
    };

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(
        sink,
        queue,
        WriterOptions::from(&state.config.hub),
        state.shutdown.child_token(),
    ));
    let reader = async {
        while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };
    tokio::select! {
        _ = reader => {},
        _ = &mut writer => {},
    }
    state.hub.unwatch_lobby(watcher).await;
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new(2.0, 20.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow());
    }

    #[test]
    fn connect_params_session_is_optional() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({
            "game_id": "g",
            "player_id": "p",
        }))
        .unwrap();
        assert!(params.session_id.is_none());
    }
}
