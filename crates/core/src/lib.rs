// Core crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billing Provider Mirror
//!
//! Maintains a queryable PostgreSQL replica of the billing provider's
//! state: products, prices, customers, payment methods, subscriptions,
//! and invoices.
//!
//! ## Features
//!
//! - **Full Sync**: per-kind reconciliation that lists everything remote,
//!   upserts each object, and deletes local records the provider no
//!   longer has
//! - **Webhooks**: signature-verified incremental updates, applied by
//!   re-fetching the referenced object
//! - **Drafts**: local placeholder subscriptions keyed by checkout
//!   session, promoted in place when the provider id arrives
//! - **Hooks**: per-kind pre-save veto and post-dispatch observers, wired
//!   explicitly at construction
//! - **Registration**: webhook endpoint lifecycle against the provider

pub mod client;
pub mod error;
pub mod link;
pub mod reconcile;
pub mod records;
pub mod registration;
pub mod store;
pub mod store_memory;
pub mod store_postgres;
pub mod syncer;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Client
pub use client::{
    BillingProvider, ListParams, Page, StripeClient, StripeConfig, WebhookEvent, WebhookVerifier,
    PAGE_SIZE,
};

// Error
pub use error::{SyncError, SyncResult};

// Link
pub use link::CrossEntityLinker;

// Reconcile
pub use reconcile::{KindOutcome, Reconciler, SyncReport, SyncerSet};

// Records
pub use records::{
    draft_subscription_update, CatalogStatus, CustomerFields, EntityKind, InvoiceFields,
    MirrorRecord, PaymentMethodFields, PriceFields, ProductFields, Projections, RecordUpdate,
    SubscriptionFields, SubscriptionPhase, SubscriptionStatus, CORRELATION_METADATA_KEY,
    DRAFT_ID_PREFIX,
};

// Registration
pub use registration::{
    resolve_signing_secret, EndpointInfo, WebhookRegistrar, REGISTERED_EVENTS,
};

// Store
pub use store::{MirrorStore, StoredRegistration, UpsertWrite};
pub use store_memory::MemoryMirrorStore;
pub use store_postgres::PgMirrorStore;

// Syncer
pub use syncer::{BeforeSaveHook, EntitySyncer, HookDecision, UpsertOutcome};

// Webhooks
pub use webhooks::{DispatchObserver, DispatchOutcome, HandledEvent, WebhookDispatcher};

use std::sync::Arc;

use sqlx::PgPool;

/// Main mirror service wiring the client, store, and sync engines over one
/// pool. Callers needing pre-save hooks or dispatch observers compose the
/// pieces directly instead.
pub struct MirrorService {
    pub client: StripeClient,
    pub store: Arc<dyn MirrorStore>,
    pub linker: CrossEntityLinker,
    pub syncers: Arc<SyncerSet>,
    pub reconciler: Reconciler,
    pub registrar: WebhookRegistrar,
    webhook_secret: Option<String>,
}

impl MirrorService {
    /// Create a new mirror service from environment variables
    pub fn from_env(pool: PgPool) -> SyncResult<Self> {
        Self::new(StripeConfig::from_env()?, pool)
    }

    /// Create a new mirror service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> SyncResult<Self> {
        let client = StripeClient::new(&config)?;
        let store: Arc<dyn MirrorStore> = Arc::new(PgMirrorStore::new(pool));
        let provider: Arc<dyn BillingProvider> = Arc::new(client.clone());
        let syncers = Arc::new(SyncerSet::new(store.clone()));

        Ok(Self {
            linker: CrossEntityLinker::new(store.clone()),
            reconciler: Reconciler::new(provider, store.clone(), syncers.clone()),
            registrar: WebhookRegistrar::new(client.clone(), store.clone()),
            syncers,
            store,
            client,
            webhook_secret: config.webhook_secret,
        })
    }

    /// Build the inbound event dispatcher. The signing secret comes from
    /// configuration when set, else from the stored registration row.
    pub async fn webhook_dispatcher(&self) -> SyncResult<WebhookDispatcher> {
        let secret = resolve_signing_secret(self.webhook_secret.as_deref(), self.store.as_ref())
            .await?
            .ok_or_else(|| {
                SyncError::Config(
                    "no webhook signing secret: set STRIPE_WEBHOOK_SECRET or register an endpoint"
                        .into(),
                )
            })?;

        Ok(WebhookDispatcher::new(
            WebhookVerifier::new(secret),
            Arc::new(self.client.clone()),
            self.syncers.clone(),
        ))
    }

    /// Record a draft placeholder for a checkout session that has not
    /// produced a provider subscription yet.
    pub async fn create_subscription_draft(
        &self,
        correlation_id: &str,
        snapshot: serde_json::Value,
    ) -> SyncResult<UpsertWrite> {
        self.store
            .upsert(&draft_subscription_update(correlation_id, snapshot))
            .await
    }
}
