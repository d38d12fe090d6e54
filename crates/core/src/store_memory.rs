//! In-memory [`MirrorStore`] for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::records::{EntityKind, MirrorRecord, RecordUpdate, SubscriptionPhase};
use crate::store::{MirrorStore, StoredRegistration, UpsertWrite};

#[derive(Default)]
struct Inner {
    tables: HashMap<EntityKind, HashMap<String, MirrorRecord>>,
    registration: Option<StoredRegistration>,
}

/// HashMap-backed store honoring the same contract as the Postgres
/// implementation, with no I/O.
#[derive(Default)]
pub struct MemoryMirrorStore {
    inner: RwLock<Inner>,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_draft(record: &MirrorRecord) -> bool {
    record
        .fields
        .as_subscription()
        .map(|f| f.phase == SubscriptionPhase::Draft)
        .unwrap_or(false)
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn find(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> SyncResult<Option<MirrorRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tables
            .get(&kind)
            .and_then(|table| table.get(external_id))
            .cloned())
    }

    async fn upsert(&self, update: &RecordUpdate) -> SyncResult<UpsertWrite> {
        let kind = update.fields.kind();
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        let table = inner.tables.entry(kind).or_default();

        if let Some(existing) = table.get_mut(&update.external_id) {
            existing.snapshot = update.snapshot.clone();
            existing.fields = update.fields.clone();
            existing.updated_at = now;
            return Ok(UpsertWrite {
                internal_id: existing.internal_id,
                created: false,
            });
        }

        let record = MirrorRecord {
            internal_id: Uuid::new_v4(),
            external_id: update.external_id.clone(),
            snapshot: update.snapshot.clone(),
            fields: update.fields.clone(),
            created_at: now,
            updated_at: now,
        };
        let internal_id = record.internal_id;
        table.insert(update.external_id.clone(), record);
        Ok(UpsertWrite {
            internal_id,
            created: true,
        })
    }

    async fn delete(&self, kind: EntityKind, external_id: &str) -> SyncResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(removed) = inner
            .tables
            .entry(kind)
            .or_default()
            .remove(external_id)
        else {
            return Ok(false);
        };

        if kind == EntityKind::Product {
            let owner = removed.internal_id;
            if let Some(prices) = inner.tables.get_mut(&EntityKind::Price) {
                prices.retain(|_, price| {
                    price.fields.as_price().and_then(|f| f.product_id) != Some(owner)
                });
            }
        }
        Ok(true)
    }

    async fn external_ids(&self, kind: EntityKind) -> SyncResult<Vec<String>> {
        let inner = self.inner.read().await;
        let Some(table) = inner.tables.get(&kind) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|record| !is_draft(record))
            .map(|record| record.external_id.clone())
            .collect())
    }

    async fn internal_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> SyncResult<Option<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tables
            .get(&kind)
            .and_then(|table| table.get(external_id))
            .map(|record| record.internal_id))
    }

    async fn customers_by_email(&self, email: &str) -> SyncResult<Vec<MirrorRecord>> {
        let inner = self.inner.read().await;
        let Some(table) = inner.tables.get(&EntityKind::Customer) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|record| {
                record
                    .fields
                    .as_customer()
                    .and_then(|f| f.email.as_deref())
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned()
            .collect())
    }

    async fn prices_for_product(&self, product_id: Uuid) -> SyncResult<Vec<MirrorRecord>> {
        let inner = self.inner.read().await;
        let Some(table) = inner.tables.get(&EntityKind::Price) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|record| {
                record.fields.as_price().and_then(|f| f.product_id) == Some(product_id)
            })
            .cloned()
            .collect())
    }

    async fn find_subscription_draft(
        &self,
        correlation_id: &str,
    ) -> SyncResult<Option<MirrorRecord>> {
        let inner = self.inner.read().await;
        let Some(table) = inner.tables.get(&EntityKind::Subscription) else {
            return Ok(None);
        };
        Ok(table
            .values()
            .find(|record| {
                record.fields.as_subscription().is_some_and(|f| {
                    f.phase == SubscriptionPhase::Draft
                        && f.correlation_id.as_deref() == Some(correlation_id)
                })
            })
            .cloned())
    }

    async fn promote_subscription_draft(
        &self,
        draft_external_id: &str,
        update: &RecordUpdate,
    ) -> SyncResult<Option<UpsertWrite>> {
        let mut inner = self.inner.write().await;
        let table = inner.tables.entry(EntityKind::Subscription).or_default();
        let Some(draft) = table.remove(draft_external_id) else {
            return Ok(None);
        };

        let record = MirrorRecord {
            internal_id: draft.internal_id,
            external_id: update.external_id.clone(),
            snapshot: update.snapshot.clone(),
            fields: update.fields.clone(),
            created_at: draft.created_at,
            updated_at: OffsetDateTime::now_utc(),
        };
        let internal_id = record.internal_id;
        table.insert(update.external_id.clone(), record);
        Ok(Some(UpsertWrite {
            internal_id,
            created: false,
        }))
    }

    async fn load_registration(&self) -> SyncResult<Option<StoredRegistration>> {
        Ok(self.inner.read().await.registration.clone())
    }

    async fn save_registration(&self, registration: &StoredRegistration) -> SyncResult<()> {
        self.inner.write().await.registration = Some(registration.clone());
        Ok(())
    }

    async fn clear_registration(&self) -> SyncResult<bool> {
        Ok(self.inner.write().await.registration.take().is_some())
    }
}
