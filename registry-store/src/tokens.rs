//! Token store seam and an in-memory implementation
//!
//! Token CRUD is not part of the storage core; the facade only forwards to whichever
//! [`TokenStore`] it was built with.

use crate::error::{StoreError, StoreResult};
use crate::model::{Token, TokenFilter};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn read_tokens(&self, filter: &TokenFilter) -> StoreResult<Vec<Token>>;

    async fn save_token(&self, token: Token) -> StoreResult<()>;

    async fn delete_token(&self, user: &str, key: &str) -> StoreResult<()>;
}

/// Process-local token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Vec<Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn read_tokens(&self, filter: &TokenFilter) -> StoreResult<Vec<Token>> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .iter()
            .filter(|token| token.user == filter.user)
            .cloned()
            .collect())
    }

    async fn save_token(&self, token: Token) -> StoreResult<()> {
        let mut tokens = self.tokens.write().await;
        if tokens
            .iter()
            .any(|existing| existing.user == token.user && existing.key == token.key)
        {
            return Err(StoreError::Conflict(format!(
                "token '{}' already exists for user '{}'",
                token.key, token.user
            )));
        }
        debug!(user = %token.user, key = %token.key, "Saving token");
        tokens.push(token);
        Ok(())
    }

    async fn delete_token(&self, user: &str, key: &str) -> StoreResult<()> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|token| !(token.user == user && token.key == key));
        if tokens.len() == before {
            return Err(StoreError::not_found(format!(
                "token '{key}' not found for user '{user}'"
            )));
        }
        debug!(user = %user, key = %key, "Deleted token");
        Ok(())
    }
}
