#[allow(dead_code)]
mod common;

use futures::SinkExt;
use tokio_tungstenite::tungstenite::Message;

use boardroom_core::net::messages::{ClientMessage, ServerMessage};
use common::{
    TestServer, create_game, join_game, wait_disconnected, ws_connect, ws_read_server_msg,
    ws_read_text, ws_read_until, ws_send, ws_send_raw, ws_try_read,
};

#[tokio::test]
async fn connect_receives_roster() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut host = ws_connect(&server.ws_url(&game_id, "host1", None)).await;
    match ws_read_until(&mut host, "active_players").await {
        ServerMessage::ActivePlayers { host_id, players, .. } => {
            assert_eq!(host_id, "host1");
            assert_eq!(players.len(), 2);
            let me = players.iter().find(|p| p.id == "host1").unwrap();
            assert!(me.is_host);
            assert!(me.connected);
        },
        other => panic!("Expected ActivePlayers, got: {other:?}"),
    }
    assert!(server.state.hub.broadcaster().is_connected(&game_id, "host1"));
}

#[tokio::test]
async fn unseated_player_is_refused() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;

    let result = tokio_tungstenite::connect_async(server.ws_url(&game_id, "ghost", None)).await;
    assert!(result.is_err());
    let url = server.ws_url("no-such-game", "host1", None);
    let result = tokio_tungstenite::connect_async(url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn verify_host_reports_role() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", None)).await;
    ws_read_until(&mut p2, "active_players").await;
    ws_send(&mut p2, &ClientMessage::VerifyHost).await;
    match ws_read_until(&mut p2, "host_verification").await {
        ServerMessage::HostVerification { player_id, is_host, .. } => {
            assert_eq!(player_id, "p2");
            assert!(!is_host);
        },
        other => panic!("Expected HostVerification, got: {other:?}"),
    }
}

#[tokio::test]
async fn host_starts_game_over_socket() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut host = ws_connect(&server.ws_url(&game_id, "host1", None)).await;
    ws_read_until(&mut host, "active_players").await;
    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", None)).await;
    ws_read_until(&mut p2, "active_players").await;

    ws_send(&mut host, &ClientMessage::StartGame).await;
    match ws_read_until(&mut p2, "game_started").await {
        ServerMessage::GameStarted { turn_order, current_turn, .. } => {
            assert_eq!(turn_order.len(), 2);
            assert_eq!(turn_order[0], current_turn);
        },
        other => panic!("Expected GameStarted, got: {other:?}"),
    }
    assert!(matches!(ws_read_server_msg(&mut p2).await, ServerMessage::GameTurn { .. }));
}

#[tokio::test]
async fn non_host_start_gets_error_event() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", None)).await;
    ws_read_until(&mut p2, "active_players").await;
    ws_send(&mut p2, &ClientMessage::StartGame).await;
    match ws_read_until(&mut p2, "error").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "permission_denied"),
        other => panic!("Expected Error, got: {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_is_primed_with_state() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    let first_session = join_game(&server, &game_id, "p2").await;

    let mut host = ws_connect(&server.ws_url(&game_id, "host1", None)).await;
    ws_read_until(&mut host, "active_players").await;

    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", Some(&first_session))).await;
    ws_read_until(&mut p2, "active_players").await;
    p2.close(None).await.unwrap();
    wait_disconnected(&server, &game_id, "p2").await;
    // Let the registry settle the disconnect before the new socket arrives.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", Some("second-session"))).await;
    match ws_read_server_msg(&mut p2).await {
        ServerMessage::ReconnectionSuccessful {
            session_id,
            previous_session_id,
            ..
        } => {
            assert_eq!(session_id, "second-session");
            assert_eq!(previous_session_id, first_session);
        },
        other => panic!("Expected ReconnectionSuccessful, got: {other:?}"),
    }
    match ws_read_server_msg(&mut p2).await {
        ServerMessage::CompleteStateSync { game } => assert_eq!(game.id, game_id),
        other => panic!("Expected CompleteStateSync, got: {other:?}"),
    }

    match ws_read_until(&mut host, "player_reconnected").await {
        ServerMessage::PlayerReconnected { player_id, .. } => assert_eq!(player_id, "p2"),
        other => panic!("Expected PlayerReconnected, got: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_types_are_relayed_verbatim() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut host = ws_connect(&server.ws_url(&game_id, "host1", None)).await;
    ws_read_until(&mut host, "active_players").await;
    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", None)).await;
    ws_read_until(&mut p2, "active_players").await;

    let raw = r#"{"type":"chat","text":"hello"}"#;
    ws_send_raw(&mut host, raw).await;
    loop {
        let text = ws_read_text(&mut p2).await;
        if text.contains("\"chat\"") {
            assert_eq!(text, raw);
            break;
        }
    }
}

#[tokio::test]
async fn leave_game_closes_socket() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let mut p2 = ws_connect(&server.ws_url(&game_id, "p2", None)).await;
    ws_read_until(&mut p2, "active_players").await;
    ws_send(&mut p2, &ClientMessage::LeaveGame).await;

    let mut closed = false;
    for _ in 0..20 {
        if ws_try_read(&mut p2, 1000).await.is_none() {
            closed = true;
            break;
        }
    }
    assert!(closed);
    wait_disconnected(&server, &game_id, "p2").await;
}

#[tokio::test]
async fn lobby_socket_tracks_new_games() {
    let server = TestServer::new().await;
    let mut lobby = ws_connect(&server.lobby_ws_url()).await;
    match ws_read_server_msg(&mut lobby).await {
        ServerMessage::LobbyUpdate { games } => assert!(games.is_empty()),
        other => panic!("Expected LobbyUpdate, got: {other:?}"),
    }

    let (game_id, _) = create_game(&server, "host1").await;
    match ws_read_until(&mut lobby, "lobby_update").await {
        ServerMessage::LobbyUpdate { games } => {
            assert_eq!(games.len(), 1);
            assert_eq!(games[0].game_id, game_id);
        },
        other => panic!("Expected LobbyUpdate, got: {other:?}"),
    }

    lobby.send(Message::Close(None)).await.unwrap();
}
