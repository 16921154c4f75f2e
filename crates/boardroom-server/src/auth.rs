use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

/// REST authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Bearer token for `/api/v1`. None = auth disabled.
    pub bearer_token: Option<String>,
}

impl AuthConfig {
    /// Whether `headers` carry the configured bearer token. Always true when
    /// no token is configured.
    pub fn authorizes(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.bearer_token.as_deref() else {
            return true;
        };
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }
}

/// Axum middleware guarding the REST API with the configured bearer token.
pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth.authorizes(request.headers()) {
        tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn disabled_auth_allows_everything() {
        let cfg = AuthConfig::default();
        assert!(cfg.authorizes(&headers(None)));
        assert!(cfg.authorizes(&headers(Some("Bearer anything"))));
    }

    #[test]
    fn token_must_match_exactly() {
        let cfg = AuthConfig {
            bearer_token: Some("secret".into()),
        };
        assert!(cfg.authorizes(&headers(Some("Bearer secret"))));
        assert!(!cfg.authorizes(&headers(Some("Bearer wrong"))));
        assert!(!cfg.authorizes(&headers(Some("secret"))));
        assert!(!cfg.authorizes(&headers(None)));
    }
}
