//! Persistence contract for mirrored records.
//!
//! One implementation per backend: [`crate::store_postgres::PgMirrorStore`]
//! for production, [`crate::store_memory::MemoryMirrorStore`] for tests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::records::{EntityKind, MirrorRecord, RecordUpdate};

/// Result of an upsert write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertWrite {
    pub internal_id: Uuid,
    /// False when an existing record was replaced.
    pub created: bool,
}

/// Stored webhook endpoint registration (single row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRegistration {
    pub endpoint_external_id: String,
    pub signing_secret: String,
}

/// Per-kind index/data persistence keyed by external id.
///
/// The index row (internal id, created_at) is created once per external id
/// and survives every later upsert; the data row is always fully replaced.
/// Both writes happen in one atomic unit.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Load one record by external id.
    async fn find(&self, kind: EntityKind, external_id: &str) -> SyncResult<Option<MirrorRecord>>;

    /// Create or fully replace the index/data pair for `update.external_id`.
    async fn upsert(&self, update: &RecordUpdate) -> SyncResult<UpsertWrite>;

    /// Remove the pair. Deleting a product also removes the prices whose
    /// resolved ownership points at it. Idempotent; returns whether
    /// anything existed.
    async fn delete(&self, kind: EntityKind, external_id: &str) -> SyncResult<bool>;

    /// All external ids for the kind. Subscription drafts are excluded:
    /// they have no remote counterpart and must survive the reconciliation
    /// diff.
    async fn external_ids(&self, kind: EntityKind) -> SyncResult<Vec<String>>;

    /// Internal id for an external id, if mirrored.
    async fn internal_id(&self, kind: EntityKind, external_id: &str)
        -> SyncResult<Option<Uuid>>;

    /// Customers whose projected email matches, case-insensitively.
    async fn customers_by_email(&self, email: &str) -> SyncResult<Vec<MirrorRecord>>;

    /// Prices owned by the given product internal id.
    async fn prices_for_product(&self, product_id: Uuid) -> SyncResult<Vec<MirrorRecord>>;

    /// The draft subscription carrying this correlation id, if any.
    async fn find_subscription_draft(
        &self,
        correlation_id: &str,
    ) -> SyncResult<Option<MirrorRecord>>;

    /// Re-key a draft to the provider-assigned external id and publish it,
    /// applying `update`. Internal id and created_at are preserved. Returns
    /// None when the draft no longer exists, in which case the caller falls
    /// back to a plain upsert.
    async fn promote_subscription_draft(
        &self,
        draft_external_id: &str,
        update: &RecordUpdate,
    ) -> SyncResult<Option<UpsertWrite>>;

    async fn load_registration(&self) -> SyncResult<Option<StoredRegistration>>;
    async fn save_registration(&self, registration: &StoredRegistration) -> SyncResult<()>;
    /// Returns whether a registration row existed.
    async fn clear_registration(&self) -> SyncResult<bool>;
}
