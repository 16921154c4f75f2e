use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use boardroom_core::GameError;

/// HTTP-facing error. Wraps the session taxonomy and maps it to a status.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation"),
            Self::Game(e) => {
                let status = match e {
                    GameError::Validation(_) => StatusCode::BAD_REQUEST,
                    GameError::NotFound(_) => StatusCode::NOT_FOUND,
                    GameError::StateConflict(_) => StatusCode::CONFLICT,
                    GameError::Permission(_) => StatusCode::FORBIDDEN,
                    GameError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    GameError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    GameError::Connection(_) => StatusCode::BAD_GATEWAY,
                };
                (status, e.code())
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "code": code })),
        )
            .into_response()
    }
}
