#[allow(dead_code)]
mod common;

use serde_json::{Value, json};

use common::{TestServer, create_game, join_game, post_as};

#[tokio::test]
async fn health_reports_games_and_connections() {
    let server = TestServer::new().await;
    create_game(&server, "host1").await;

    let resp = reqwest::get(format!("{}/health", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["games"]["games"], 1);
    assert_eq!(body["games"]["lobby"], 1);
    assert_eq!(body["connections"]["websocket"], 0);
}

#[tokio::test]
async fn ready_probes_store() {
    let server = TestServer::new().await;
    let resp = reqwest::get(format!("{}/ready", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ready");
}

#[tokio::test]
async fn create_join_and_list() {
    let server = TestServer::new().await;
    let (game_id, room_code) = create_game(&server, "host1").await;
    assert_eq!(room_code.len(), 9);
    assert_eq!(&room_code[4..5], "-");

    let session = join_game(&server, &game_id, "p2").await;
    assert!(!session.is_empty());

    let listing: Value = reqwest::get(server.api("/games"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let games = listing.as_array().unwrap();
    assert_eq!(games.len(), 1);
    assert_eq!(games[0]["game_id"], game_id.as_str());
    assert_eq!(games[0]["player_count"], 2);

    let game: Value = reqwest::get(server.api(&format!("/games/{game_id}")))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(game["host_id"], "host1");
    assert_eq!(game["status"], "LOBBY");
}

#[tokio::test]
async fn room_code_lookup() {
    let server = TestServer::new().await;
    let (game_id, room_code) = create_game(&server, "host1").await;

    let resp = reqwest::get(server.api(&format!("/rooms/{}", room_code.to_lowercase())))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["game_id"], game_id.as_str());

    let resp = reqwest::get(server.api("/rooms/ABCD-0000")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = reqwest::get(server.api("/rooms/nonsense")).await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn start_requires_host_and_enough_players() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;

    let resp = post_as(&server, &game_id, "start", "host1").await;
    assert_eq!(resp.status(), 409);

    join_game(&server, &game_id, "p2").await;
    let resp = post_as(&server, &game_id, "start", "p2").await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "permission_denied");

    let resp = post_as(&server, &game_id, "start", "host1").await;
    assert_eq!(resp.status(), 200);
    let events: Value = resp.json().await.unwrap();
    assert_eq!(events[0]["type"], "game_started");

    let resp = reqwest::Client::new()
        .post(server.api(&format!("/games/{game_id}/join")))
        .json(&json!({ "player_id": "late" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn actions_respect_turn_order() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;
    post_as(&server, &game_id, "start", "host1").await;

    let game: Value = reqwest::get(server.api(&format!("/games/{game_id}")))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let current = game["current_turn"].as_str().unwrap().to_string();
    let waiting = if current == "host1" { "p2" } else { "host1" };

    let client = reqwest::Client::new();
    let resp = client
        .post(server.api(&format!("/games/{game_id}/actions")))
        .json(&json!({ "player_id": waiting, "action": { "kind": "roll_dice" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not your turn");

    let resp = client
        .post(server.api(&format!("/games/{game_id}/actions")))
        .json(&json!({ "player_id": current, "action": { "kind": "roll_dice" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let events: Value = resp.json().await.unwrap();
    assert!(
        events
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["type"] == "dice_rolled")
    );
}

#[tokio::test]
async fn pause_and_resume_are_host_only() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;
    post_as(&server, &game_id, "start", "host1").await;

    assert_eq!(post_as(&server, &game_id, "pause", "p2").await.status(), 403);
    let resp = post_as(&server, &game_id, "pause", "host1").await;
    assert_eq!(resp.status(), 200);
    let events: Value = resp.json().await.unwrap();
    assert_eq!(events[0]["type"], "game_paused");
    assert_eq!(post_as(&server, &game_id, "pause", "host1").await.status(), 409);

    let resp = post_as(&server, &game_id, "resume", "host1").await;
    assert_eq!(resp.status(), 200);
    let events: Value = resp.json().await.unwrap();
    assert_eq!(events[0]["type"], "game_resumed");
}

#[tokio::test]
async fn delete_is_host_only() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let client = reqwest::Client::new();
    let resp = client
        .delete(server.api(&format!("/games/{game_id}?player_id=p2")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .delete(server.api(&format!("/games/{game_id}?player_id=host1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = reqwest::get(server.api(&format!("/games/{game_id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn maintenance_cleanup_keeps_fresh_games() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;

    let resp = reqwest::Client::new()
        .post(server.api("/maintenance/cleanup"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["removed"].as_array().unwrap().is_empty());
    assert!(server.state.registry.contains(&game_id).await);
}

#[tokio::test]
async fn recent_events_validates_limit() {
    let server = TestServer::new().await;
    let (game_id, _) = create_game(&server, "host1").await;
    join_game(&server, &game_id, "p2").await;
    post_as(&server, &game_id, "start", "host1").await;

    let resp = reqwest::get(server.api("/events?limit=0")).await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(server.api("/events?limit=10")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let events: Value = resp.json().await.unwrap();
    assert!(
        events
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["game_id"] == game_id.as_str())
    );
}

#[tokio::test]
async fn api_rejected_without_token() {
    let server = TestServer::with_auth("test-token").await;
    let client = reqwest::Client::new();

    let resp = client.get(server.api("/games")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(server.api("/games"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(server.api("/games"))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Health stays public.
    let resp = client
        .get(format!("{}/health", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
