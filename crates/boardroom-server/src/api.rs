use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use boardroom_core::net::messages::{LobbyEntry, ServerMessage};
use boardroom_core::player::PlayerId;
use boardroom_core::rules::ActionKind;
use boardroom_core::session::{GameId, GameSession, SessionId};

use crate::error::AppError;
use crate::queue::QueuedEvent;
use crate::state::AppState;

/// Upper bound on `GET /api/v1/events?limit=`.
const MAX_RECENT_EVENTS: usize = 500;

#[derive(Debug, Deserialize)]
pub struct CreateGameBody {
    pub host_id: PlayerId,
    pub name: String,
    #[serde(default)]
    pub max_players: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGameResponse {
    pub game_id: GameId,
    pub room_code: String,
}

/// Body shared by every endpoint acting on behalf of one player.
#[derive(Debug, Deserialize)]
pub struct PlayerBody {
    pub player_id: PlayerId,
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub player_id: PlayerId,
    pub action: ActionKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub game_id: GameId,
    pub session_id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomLookupResponse {
    pub game_id: GameId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: Vec<GameId>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// POST /api/v1/games
pub async fn create_game(
    State(state): State<AppState>,
    Json(body): Json<CreateGameBody>,
) -> Result<(StatusCode, Json<CreateGameResponse>), AppError> {
    let max_players = body
        .max_players
        .unwrap_or(state.config.sessions.max_players);
    let game_id = state
        .registry
        .create_game(&body.host_id, &body.name, max_players)
        .await?;
    let room_code = state.registry.snapshot(&game_id).await?.room_code;
    Ok((StatusCode::CREATED, Json(CreateGameResponse { game_id, room_code })))
}

/// GET /api/v1/games: joinable games, oldest first.
pub async fn list_games(State(state): State<AppState>) -> Json<Vec<LobbyEntry>> {
    Json(state.registry.lobby_listing().await)
}

/// GET /api/v1/games/{id}
pub async fn get_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
) -> Result<Json<GameSession>, AppError> {
    Ok(Json(state.registry.snapshot(&id).await?))
}

/// GET /api/v1/rooms/{code}
pub async fn find_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RoomLookupResponse>, AppError> {
    let game_id = state.registry.find_by_room_code(&code)?;
    Ok(Json(RoomLookupResponse { game_id }))
}

/// POST /api/v1/games/{id}/join
pub async fn join_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<Json<SessionResponse>, AppError> {
    let session_id = state.registry.join_game(&id, &body.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(Json(SessionResponse { game_id: id, session_id }))
}

/// POST /api/v1/games/{id}/rejoin
pub async fn rejoin_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<Json<SessionResponse>, AppError> {
    let session_id = state.registry.rejoin_game(&id, &body.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(Json(SessionResponse { game_id: id, session_id }))
}

/// POST /api/v1/games/{id}/start
pub async fn start_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<Json<Vec<ServerMessage>>, AppError> {
    let events = state.registry.start_game(&id, &body.player_id).await?;
    state.hub.announce_roster(&id).await;
    Ok(Json(events))
}

/// POST /api/v1/games/{id}/actions
pub async fn post_action(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<ActionBody>,
) -> Result<Json<Vec<ServerMessage>>, AppError> {
    let events = state
        .registry
        .process_action(&id, &body.player_id, body.action)
        .await?;
    Ok(Json(events))
}

/// POST /api/v1/games/{id}/reset: ABANDONED back to LOBBY.
pub async fn reset_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<StatusCode, AppError> {
    state.registry.reset_game_status(&id, &body.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/games/{id}/pause
pub async fn pause_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<Json<Vec<ServerMessage>>, AppError> {
    let events = state.registry.pause_game(&id, &body.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(Json(events))
}

/// POST /api/v1/games/{id}/resume
pub async fn resume_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Json(body): Json<PlayerBody>,
) -> Result<Json<Vec<ServerMessage>>, AppError> {
    let events = state.registry.resume_game(&id, &body.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(Json(events))
}

/// DELETE /api/v1/games/{id}?player_id=: host only.
pub async fn delete_game(
    State(state): State<AppState>,
    Path(id): Path<GameId>,
    Query(params): Query<PlayerBody>,
) -> Result<StatusCode, AppError> {
    state.registry.delete_game(&id, &params.player_id).await?;
    state.hub.refresh_view(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/maintenance/cleanup: run the stale-game sweep now.
pub async fn run_cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let removed = state.registry.cleanup_stale_games().await;
    for id in &removed {
        state.hub.refresh_view(id).await;
    }
    Json(CleanupResponse { removed })
}

/// GET /api/v1/events?limit=: most recent queued events.
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<QueuedEvent>>, AppError> {
    let limit = query.limit.unwrap_or(50);
    if limit == 0 || limit > MAX_RECENT_EVENTS {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {MAX_RECENT_EVENTS}"
        )));
    }
    Ok(Json(state.queue.recent(limit)))
}
