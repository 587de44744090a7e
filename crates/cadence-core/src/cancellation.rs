use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-run cancellation tokens. `stop` cancels the token so in-flight
/// tool handlers can wind down; it never force-aborts them.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(id.to_string(), token.clone());
        token
    }

    pub async fn get(&self, id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(id).cloned()
    }

    pub async fn get_or_create(&self, id: &str) -> CancellationToken {
        if let Some(token) = self.get(id).await {
            return token;
        }
        self.create(id).await
    }

    pub async fn cancel(&self, id: &str) {
        if let Some(token) = self.tokens.read().await.get(id) {
            token.cancel();
        }
    }

    pub async fn remove(&self, id: &str) {
        self.tokens.write().await.remove(id);
    }
}
