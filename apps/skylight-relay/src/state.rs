use std::sync::Arc;

use crate::auth::{AuthConfig, AuthContext};
use crate::config::Config;
use crate::session::SessionEngine;
use crate::store::{Store, StoreError};
use crate::trust::TrustLedger;

/// Shared handle wiring the management surface to the engine, ledger, and
/// store. Cheap to clone; axum keeps one per router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub engine: SessionEngine,
    pub ledger: TrustLedger,
    pub auth: Arc<AuthContext>,
}

impl AppState {
    /// Pick the store backend from configuration: Redis when a URL is
    /// configured, the in-memory store otherwise.
    pub async fn connect(config: Config) -> Result<Self, StoreError> {
        let store = match &config.redis_url {
            Some(url) => Store::connect_redis(url).await?,
            None => Store::memory(),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Store) -> Self {
        let auth = AuthContext::new(AuthConfig {
            secret: config.auth_secret.clone(),
            bypass: config.auth_bypass,
        });
        Self {
            engine: SessionEngine::new(store.clone()),
            ledger: TrustLedger::new(store.clone()),
            auth: Arc::new(auth),
            store,
            config: Arc::new(config),
        }
    }

    #[cfg(test)]
    pub fn in_memory(config: Config) -> Self {
        Self::with_store(config, Store::memory())
    }
}
