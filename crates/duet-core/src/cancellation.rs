use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks the cancellation token of each in-flight chain by chain id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, chain_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(chain_id.to_string(), token.clone());
        token
    }

    /// Cancels the token for `chain_id` if present. Returns whether a token
    /// was found.
    pub async fn cancel(&self, chain_id: &str) -> bool {
        let tokens = self.tokens.read().await;
        match tokens.get(chain_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, chain_id: &str) {
        self.tokens.write().await.remove(chain_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_cancel_trips_the_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("chain-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("chain-1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_chain_reports_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }

    #[tokio::test]
    async fn remove_forgets_the_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("chain-2").await;
        registry.remove("chain-2").await;
        assert!(!registry.cancel("chain-2").await);
        assert!(!token.is_cancelled());
    }
}
