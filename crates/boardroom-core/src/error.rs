use thiserror::Error;

/// Every failure a session operation can report to its caller.
///
/// State-machine variants (`Validation`, `NotFound`, `StateConflict`,
/// `Permission`) are returned before any mutation happens. Infrastructure
/// variants (`ResourceExhausted`, `Persistence`, `Connection`) describe
/// degraded delivery or storage and never roll back in-memory state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    StateConflict(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("connection error: {0}")]
    Connection(String),
}

impl GameError {
    /// Stable machine-readable code carried in outbound `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::StateConflict(_) => "state_conflict",
            Self::Permission(_) => "permission_denied",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Persistence(_) => "persistence",
            Self::Connection(_) => "connection",
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn game_not_found(game_id: &str) -> Self {
        Self::NotFound(format!("game {game_id}"))
    }

    pub fn player_not_found(player_id: &str) -> Self {
        Self::NotFound(format!("player {player_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GameError::conflict("x").code(), "state_conflict");
        assert_eq!(GameError::game_not_found("g").code(), "not_found");
        assert_eq!(GameError::Permission("p".into()).code(), "permission_denied");
    }

    #[test]
    fn display_includes_context() {
        assert_eq!(GameError::game_not_found("g1").to_string(), "game g1 not found");
        assert_eq!(GameError::conflict("not your turn").to_string(), "not your turn");
    }
}
