//! Application state

use std::sync::Arc;

use billmirror_core::{MirrorService, Reconciler, WebhookDispatcher};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    /// Wire the mirror engine over the pool. Fails when provider
    /// credentials are absent or no webhook signing secret can be resolved
    /// from either the environment or the stored registration.
    pub async fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let service = MirrorService::from_env(pool)?;
        let dispatcher = Arc::new(service.webhook_dispatcher().await?);
        tracing::info!("Mirror service initialized");

        Ok(Self {
            config,
            dispatcher,
            reconciler: Arc::new(service.reconciler),
        })
    }
}
