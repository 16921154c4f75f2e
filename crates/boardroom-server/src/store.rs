use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use boardroom_core::GameError;
use boardroom_core::session::{GameId, GameSession, GameStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("game {0} not found in store")]
    NotFound(GameId),
    #[error("document encoding failed: {0}")]
    Encoding(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for GameError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GameError::game_not_found(&id),
            other => GameError::Persistence(other.to_string()),
        }
    }
}

/// Durable document store for game records.
#[async_trait]
pub trait GameStore: Send + Sync {
    async fn insert(&self, game: &GameSession) -> Result<(), StoreError>;

    /// Replace the stored document for `game.id`.
    async fn update(&self, game: &GameSession) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<GameSession>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn find_by_status(&self, statuses: &[GameStatus]) -> Result<Vec<GameSession>, StoreError>;

    async fn room_code_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Cheap liveness probe used by the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Process-local store keeping each game as an encoded JSON document.
#[derive(Default)]
pub struct InMemoryGameStore {
    docs: RwLock<HashMap<GameId, String>>,
}

impl InMemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn encode(game: &GameSession) -> Result<String, StoreError> {
        serde_json::to_string(game).map_err(|e| StoreError::Encoding(e.to_string()))
    }

    fn decode(doc: &str) -> Result<GameSession, StoreError> {
        serde_json::from_str(doc).map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

#[async_trait]
impl GameStore for InMemoryGameStore {
    async fn insert(&self, game: &GameSession) -> Result<(), StoreError> {
        let doc = Self::encode(game)?;
        self.docs.write().await.insert(game.id.clone(), doc);
        Ok(())
    }

    async fn update(&self, game: &GameSession) -> Result<(), StoreError> {
        let doc = Self::encode(game)?;
        let mut docs = self.docs.write().await;
        match docs.get_mut(&game.id) {
            Some(slot) => {
                *slot = doc;
                Ok(())
            },
            None => Err(StoreError::NotFound(game.id.clone())),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<GameSession>, StoreError> {
        let docs = self.docs.read().await;
        docs.get(id).map(|doc| Self::decode(doc)).transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.docs.write().await.remove(id);
        Ok(())
    }

    async fn find_by_status(
        &self,
        statuses: &[GameStatus],
    ) -> Result<Vec<GameSession>, StoreError> {
        let docs = self.docs.read().await;
        let mut out = Vec::new();
        for doc in docs.values() {
            let game = Self::decode(doc)?;
            if statuses.contains(&game.status) {
                out.push(game);
            }
        }
        Ok(out)
    }

    async fn room_code_exists(&self, code: &str) -> Result<bool, StoreError> {
        let docs = self.docs.read().await;
        for doc in docs.values() {
            if Self::decode(doc)?.room_code == code {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
