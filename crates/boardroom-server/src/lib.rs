pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod pipeline;
pub mod presence;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod sse;
pub mod state;
pub mod store;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use reaper::{ReaperIntervals, spawn_reaper};
use state::AppState;
use store::{GameStore, InMemoryGameStore};

/// Build the Axum router and application state from a config, backed by the
/// in-memory store.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    build_app_with_store(config, Arc::new(InMemoryGameStore::new()))
}

pub fn build_app_with_store(
    config: ServerConfig,
    store: Arc<dyn GameStore>,
) -> (Router<()>, AppState) {
    let state = AppState::new(config, store);
    (router(state.clone()), state)
}

/// Routes over an already-wired state.
pub fn router(state: AppState) -> Router<()> {
    // API routes (behind bearer auth middleware)
    let api_routes = Router::new()
        .route("/games", post(api::create_game).get(api::list_games))
        .route("/games/{id}", get(api::get_game).delete(api::delete_game))
        .route("/games/{id}/join", post(api::join_game))
        .route("/games/{id}/rejoin", post(api::rejoin_game))
        .route("/games/{id}/start", post(api::start_game))
        .route("/games/{id}/actions", post(api::post_action))
        .route("/games/{id}/reset", post(api::reset_game))
        .route("/games/{id}/pause", post(api::pause_game))
        .route("/games/{id}/resume", post(api::resume_game))
        .route("/rooms/{code}", get(api::find_room))
        .route("/maintenance/cleanup", post(api::run_cleanup))
        .route("/events", get(api::recent_events))
        .route("/events/stream", get(sse::event_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_auth_middleware,
        ));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/ws/lobby", get(ws::lobby_ws_handler))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn the reaper for `state`. It stops when `state.shutdown` fires.
pub fn spawn_background(state: &AppState) -> JoinHandle<()> {
    spawn_reaper(
        state.hub.clone(),
        ReaperIntervals::from(state.config.as_ref()),
        state.shutdown.child_token(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use config::AuthFileConfig;

    fn app_with_token(token: &str) -> (Router<()>, AppState) {
        build_app(ServerConfig {
            auth: AuthFileConfig {
                bearer_token: Some(token.into()),
            },
            ..ServerConfig::default()
        })
    }

    #[tokio::test]
    async fn api_requires_bearer_but_probes_do_not() {
        let (app, state) = app_with_token("t0k");

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/games").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/games")
                    .header("authorization", "Bearer t0k")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_game_maps_to_not_found() {
        let (app, state) = build_app(ServerConfig::default());
        let resp = app
            .oneshot(Request::get("/api/v1/games/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        state.shutdown.cancel();
    }
}
