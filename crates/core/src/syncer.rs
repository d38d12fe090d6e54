//! Per-kind upsert and delete engine.
//!
//! Every write funnels through here, whether it came from a bulk
//! reconciliation pass or a single webhook event. The pre-save hook runs
//! before anything touches the store and can veto the write outright.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::link::CrossEntityLinker;
use crate::records::{self, EntityKind, Projections, RecordUpdate};
use crate::store::MirrorStore;

/// Verdict returned by a [`BeforeSaveHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Save,
    Skip,
}

/// Caller-supplied veto consulted before every write of the kind. Wired in
/// explicitly at construction; there is no dynamic registry.
pub type BeforeSaveHook = Arc<dyn Fn(EntityKind, &Value) -> HookDecision + Send + Sync>;

/// What one snapshot push did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied { internal_id: Uuid, created: bool },
    /// The pre-save hook vetoed the write. Local state is untouched; this
    /// is a decision, not a failure.
    Cancelled,
}

#[derive(Clone)]
pub struct EntitySyncer {
    kind: EntityKind,
    store: Arc<dyn MirrorStore>,
    linker: CrossEntityLinker,
    before_save: Option<BeforeSaveHook>,
}

impl EntitySyncer {
    pub fn new(kind: EntityKind, store: Arc<dyn MirrorStore>) -> Self {
        Self {
            kind,
            linker: CrossEntityLinker::new(store.clone()),
            store,
            before_save: None,
        }
    }

    pub fn with_before_save(mut self, hook: BeforeSaveHook) -> Self {
        self.before_save = Some(hook);
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Mirror one provider snapshot: veto check, projection, ownership
    /// resolution, then the store write. Idempotent per external id.
    pub async fn upsert(&self, snapshot: &Value) -> SyncResult<UpsertOutcome> {
        let external_id = records::external_id(snapshot)?;

        if let Some(hook) = &self.before_save {
            if hook(self.kind, snapshot) == HookDecision::Skip {
                warn!(kind = %self.kind, external_id = %external_id, "Pre-save hook skipped record");
                return Ok(UpsertOutcome::Cancelled);
            }
        }

        let update = self.build_update(external_id, snapshot).await?;

        if self.kind == EntityKind::Subscription {
            if let Some(write) = self.try_promote_draft(&update).await? {
                return Ok(UpsertOutcome::Applied {
                    internal_id: write.internal_id,
                    created: write.created,
                });
            }
        }

        let write = self.store.upsert(&update).await?;
        debug!(
            kind = %self.kind,
            external_id = %update.external_id,
            created = write.created,
            "Mirrored record"
        );
        Ok(UpsertOutcome::Applied {
            internal_id: write.internal_id,
            created: write.created,
        })
    }

    /// Drop the local record. Idempotent; returns whether anything existed.
    pub async fn delete(&self, external_id: &str) -> SyncResult<bool> {
        let existed = self.store.delete(self.kind, external_id).await?;
        if existed {
            info!(kind = %self.kind, external_id = %external_id, "Deleted mirrored record");
        }
        Ok(existed)
    }

    async fn build_update(&self, external_id: String, snapshot: &Value) -> SyncResult<RecordUpdate> {
        let mut fields = Projections::from_snapshot(self.kind, snapshot);

        if let Some(price) = fields.as_price_mut() {
            price.product_id = self
                .linker
                .resolve_product_owner(price.product_external_id.as_deref())
                .await?;
        }

        Ok(RecordUpdate {
            external_id,
            snapshot: snapshot.clone(),
            fields,
        })
    }

    /// A subscription arriving under a provider id it was never mirrored
    /// under may be the published form of a local draft. Match on the
    /// correlation id and re-key the draft row in place of inserting.
    async fn try_promote_draft(
        &self,
        update: &RecordUpdate,
    ) -> SyncResult<Option<crate::store::UpsertWrite>> {
        let Some(correlation_id) = update
            .fields
            .as_subscription()
            .and_then(|f| f.correlation_id.clone())
        else {
            return Ok(None);
        };
        if self
            .store
            .find(EntityKind::Subscription, &update.external_id)
            .await?
            .is_some()
        {
            // Already mirrored under its own id.
            return Ok(None);
        }
        let Some(draft) = self.store.find_subscription_draft(&correlation_id).await? else {
            return Ok(None);
        };

        let write = self
            .store
            .promote_subscription_draft(&draft.external_id, update)
            .await?;
        if write.is_some() {
            info!(
                correlation_id = %correlation_id,
                external_id = %update.external_id,
                "Promoted subscription draft"
            );
        }
        Ok(write)
    }
}

#[cfg(test)]
mod syncer_tests {
    use super::*;
    use crate::records::{draft_subscription_update, SubscriptionPhase, CORRELATION_METADATA_KEY};
    use crate::store_memory::MemoryMirrorStore;
    use serde_json::json;

    #[tokio::test]
    async fn hook_veto_leaves_the_store_untouched() {
        let store = Arc::new(MemoryMirrorStore::new());
        let syncer = EntitySyncer::new(EntityKind::Product, store.clone()).with_before_save(
            Arc::new(|_, snapshot| {
                if snapshot["id"] == "prod_blocked" {
                    HookDecision::Skip
                } else {
                    HookDecision::Save
                }
            }),
        );

        let outcome = syncer.upsert(&json!({"id": "prod_blocked"})).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Cancelled);
        assert!(store
            .find(EntityKind::Product, "prod_blocked")
            .await
            .unwrap()
            .is_none());

        let outcome = syncer.upsert(&json!({"id": "prod_ok"})).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Applied { created: true, .. }));
    }

    #[tokio::test]
    async fn price_upsert_resolves_product_ownership() {
        let store = Arc::new(MemoryMirrorStore::new());
        let products = EntitySyncer::new(EntityKind::Product, store.clone());
        let prices = EntitySyncer::new(EntityKind::Price, store.clone());

        products.upsert(&json!({"id": "prod_1"})).await.unwrap();
        prices
            .upsert(&json!({"id": "price_1", "product": "prod_1"}))
            .await
            .unwrap();

        let price = store
            .find(EntityKind::Price, "price_1")
            .await
            .unwrap()
            .unwrap();
        let owner = store
            .internal_id(EntityKind::Product, "prod_1")
            .await
            .unwrap();
        assert_eq!(price.fields.as_price().unwrap().product_id, owner);
    }

    #[tokio::test]
    async fn unknown_product_leaves_ownership_unresolved() {
        let store = Arc::new(MemoryMirrorStore::new());
        let prices = EntitySyncer::new(EntityKind::Price, store.clone());

        prices
            .upsert(&json!({"id": "price_1", "product": "prod_out_of_order"}))
            .await
            .unwrap();

        let price = store
            .find(EntityKind::Price, "price_1")
            .await
            .unwrap()
            .unwrap();
        let fields = price.fields.as_price().unwrap();
        assert_eq!(fields.product_id, None);
        assert_eq!(
            fields.product_external_id.as_deref(),
            Some("prod_out_of_order")
        );
    }

    #[tokio::test]
    async fn subscription_upsert_promotes_a_matching_draft() {
        let store = Arc::new(MemoryMirrorStore::new());
        let draft_write = store
            .upsert(&draft_subscription_update("sess-1", json!({})))
            .await
            .unwrap();

        let syncer = EntitySyncer::new(EntityKind::Subscription, store.clone());
        let outcome = syncer
            .upsert(&json!({
                "id": "sub_1",
                "status": "active",
                "metadata": { CORRELATION_METADATA_KEY: "sess-1" }
            }))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UpsertOutcome::Applied {
                internal_id: draft_write.internal_id,
                created: false
            }
        );
        let published = store
            .find(EntityKind::Subscription, "sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            published.fields.as_subscription().unwrap().phase,
            SubscriptionPhase::Published
        );
        assert!(store
            .find_subscription_draft("sess-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn subscription_without_correlation_inserts_normally() {
        let store = Arc::new(MemoryMirrorStore::new());
        store
            .upsert(&draft_subscription_update("sess-1", json!({})))
            .await
            .unwrap();

        let syncer = EntitySyncer::new(EntityKind::Subscription, store.clone());
        let outcome = syncer
            .upsert(&json!({"id": "sub_other", "status": "active"}))
            .await
            .unwrap();

        assert!(matches!(outcome, UpsertOutcome::Applied { created: true, .. }));
        // The unrelated draft is still waiting.
        assert!(store
            .find_subscription_draft("sess-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_existed() {
        let store = Arc::new(MemoryMirrorStore::new());
        let syncer = EntitySyncer::new(EntityKind::Customer, store.clone());

        syncer.upsert(&json!({"id": "cus_1"})).await.unwrap();
        assert!(syncer.delete("cus_1").await.unwrap());
        assert!(!syncer.delete("cus_1").await.unwrap());
    }
}
