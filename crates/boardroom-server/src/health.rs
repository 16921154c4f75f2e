use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::registry::RegistryStats;
use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub games: RegistryStats,
    pub pending_tasks: usize,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
    pub sse: usize,
    pub clients: usize,
    pub lobby_watchers: usize,
}

/// GET /health: connection counts and registry totals.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broadcaster = state.hub.broadcaster();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo {
            websocket: state.ws_connections(),
            sse: state.sse_subscribers(),
            clients: broadcaster.client_count(),
            lobby_watchers: broadcaster.lobby_watcher_count(),
        },
        games: state.registry.stats().await,
        pending_tasks: state.scheduler.pending(),
    })
}

/// GET /ready: probes the game store under a hard timeout.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let timeout = Duration::from_millis(state.config.sessions.store_probe_timeout_ms);
    match tokio::time::timeout(timeout, state.store.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, "ready"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Store probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "not ready: store unavailable")
        },
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Store probe timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "not ready: store probe timed out")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            connections: ConnectionInfo {
                websocket: 5,
                sse: 2,
                clients: 4,
                lobby_watchers: 1,
            },
            games: RegistryStats {
                games: 1,
                active: 1,
                players: 3,
                ..Default::default()
            },
            pending_tasks: 0,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(json.contains("\"websocket\":5"));
        assert!(json.contains("\"active\":1"));
    }
}
