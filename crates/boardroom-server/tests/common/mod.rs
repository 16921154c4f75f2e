use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use boardroom_core::net::messages::{ClientMessage, ServerMessage};
use boardroom_core::net::protocol::{decode_server_message, encode_client_message};

use boardroom_server::build_app;
use boardroom_server::config::{AuthFileConfig, ServerConfig};
use boardroom_server::state::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with no auth.
    pub async fn new() -> Self {
        Self::from_config(ServerConfig::default()).await
    }

    /// Start a test server requiring `token` on the REST API.
    pub async fn with_auth(token: &str) -> Self {
        let config = ServerConfig {
            auth: AuthFileConfig {
                bearer_token: Some(token.to_string()),
            },
            ..ServerConfig::default()
        };
        Self::from_config(config).await
    }

    pub async fn from_config(mut config: ServerConfig) -> Self {
        // Keep frame pacing out of test timings.
        config.hub.min_send_interval_ms = 0;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn api(&self, path: &str) -> String {
        format!("http://{}/api/v1{path}", self.addr)
    }

    pub fn ws_url(&self, game_id: &str, player_id: &str, session_id: Option<&str>) -> String {
        let mut url = format!("ws://{}/ws?game_id={game_id}&player_id={player_id}", self.addr);
        if let Some(session) = session_id {
            url.push_str(&format!("&session_id={session}"));
        }
        url
    }

    pub fn lobby_ws_url(&self) -> String {
        format!("ws://{}/ws/lobby", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// POST /games, returning `(game_id, room_code)`.
pub async fn create_game(server: &TestServer, host: &str) -> (String, String) {
    let resp = reqwest::Client::new()
        .post(server.api("/games"))
        .json(&json!({ "host_id": host, "name": "Test Game", "max_players": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    (
        body["game_id"].as_str().unwrap().to_string(),
        body["room_code"].as_str().unwrap().to_string(),
    )
}

/// POST /games/{id}/join, returning the issued session id.
pub async fn join_game(server: &TestServer, game_id: &str, player: &str) -> String {
    let resp = reqwest::Client::new()
        .post(server.api(&format!("/games/{game_id}/join")))
        .json(&json!({ "player_id": player }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

/// POST to a player-scoped game endpoint, returning the raw response.
pub async fn post_as(
    server: &TestServer,
    game_id: &str,
    action: &str,
    player: &str,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(server.api(&format!("/games/{game_id}/{action}")))
        .json(&json!({ "player_id": player }))
        .send()
        .await
        .unwrap()
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Send a ClientMessage.
pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Text(encoded.into())).await.unwrap();
}

/// Send a raw text frame.
pub async fn ws_send_raw(stream: &mut WsStream, text: &str) {
    stream.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Read the next text frame (5s timeout).
pub async fn ws_read_text(stream: &mut WsStream) -> String {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Read the next ServerMessage (5s timeout).
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let text = ws_read_text(stream).await;
    decode_server_message(&text).unwrap()
}

/// Skip frames until one of kind `kind` arrives (5s timeout per frame).
pub async fn ws_read_until(stream: &mut WsStream, kind: &str) -> ServerMessage {
    loop {
        let msg = ws_read_server_msg(stream).await;
        if msg.kind() == kind {
            return msg;
        }
    }
}

/// Try to read a text frame, returning None on timeout or close.
pub async fn ws_try_read(stream: &mut WsStream, timeout_ms: u64) -> Option<String> {
    let deadline = Duration::from_millis(timeout_ms);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Wait until the server side reports `player` of `game_id` as having no
/// live socket.
pub async fn wait_disconnected(server: &TestServer, game_id: &str, player: &str) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while server.state.hub.broadcaster().is_connected(game_id, player) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for disconnect");
}
