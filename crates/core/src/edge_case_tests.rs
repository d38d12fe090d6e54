// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Mirror Engine
//!
//! Tests critical boundary conditions in:
//! - Upsert identity and overwrite semantics
//! - Full-sync reconciliation and orphan deletion
//! - Webhook verification, dispatch, and draft promotion

#[cfg(test)]
mod upsert_semantics_tests {
    use crate::records::{CatalogStatus, EntityKind};
    use crate::store::MirrorStore;
    use crate::store_memory::MemoryMirrorStore;
    use crate::syncer::{EntitySyncer, UpsertOutcome};
    use serde_json::json;
    use std::sync::Arc;

    // =========================================================================
    // Upserting the same object twice keeps internal id and created_at
    // =========================================================================
    #[tokio::test]
    async fn repeated_upsert_preserves_identity() {
        let store = Arc::new(MemoryMirrorStore::new());
        let syncer = EntitySyncer::new(EntityKind::Product, store.clone());

        let first = syncer
            .upsert(&json!({"id": "prod_1", "name": "Widget"}))
            .await
            .unwrap();
        let before = store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .unwrap();

        let second = syncer
            .upsert(&json!({"id": "prod_1", "name": "Widget"}))
            .await
            .unwrap();
        let after = store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .unwrap();

        let UpsertOutcome::Applied {
            internal_id: first_id,
            created: true,
        } = first
        else {
            panic!("first upsert should create: {first:?}");
        };
        let UpsertOutcome::Applied {
            internal_id: second_id,
            created: false,
        } = second
        else {
            panic!("second upsert should replace: {second:?}");
        };

        assert_eq!(first_id, second_id);
        assert_eq!(before.created_at, after.created_at);
    }

    // =========================================================================
    // A newer snapshot fully replaces the stored one, projections included
    // =========================================================================
    #[tokio::test]
    async fn newer_snapshot_overwrites_data_and_projection() {
        let store = Arc::new(MemoryMirrorStore::new());
        let syncer = EntitySyncer::new(EntityKind::Product, store.clone());

        syncer
            .upsert(&json!({"id": "prod_1", "name": "Widget", "active": true}))
            .await
            .unwrap();
        syncer
            .upsert(&json!({"id": "prod_1", "name": "Widget Pro", "active": false}))
            .await
            .unwrap();

        let record = store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.snapshot["name"], "Widget Pro");
        assert!(record.snapshot.get("description").is_none());

        let crate::records::Projections::Product(fields) = &record.fields else {
            panic!("wrong projection kind");
        };
        assert_eq!(fields.status, CatalogStatus::Archived);
    }

    // =========================================================================
    // Archived is a remote lifecycle fact, not a local disablement
    // =========================================================================
    #[tokio::test]
    async fn archived_product_stays_present_and_queryable() {
        let store = Arc::new(MemoryMirrorStore::new());
        let syncer = EntitySyncer::new(EntityKind::Product, store.clone());

        syncer
            .upsert(&json!({"id": "prod_1", "active": false}))
            .await
            .unwrap();

        let record = store.find(EntityKind::Product, "prod_1").await.unwrap();
        assert!(record.is_some(), "archived products remain mirrored");
        assert!(store
            .external_ids(EntityKind::Product)
            .await
            .unwrap()
            .contains(&"prod_1".to_string()));
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use crate::reconcile::{Reconciler, SyncerSet};
    use crate::records::{draft_subscription_update, EntityKind};
    use crate::store::MirrorStore;
    use crate::store_memory::MemoryMirrorStore;
    use crate::syncer::EntitySyncer;
    use crate::test_support::FakeProvider;
    use serde_json::json;
    use std::sync::Arc;

    fn engine(
        provider: &Arc<FakeProvider>,
        store: &Arc<MemoryMirrorStore>,
    ) -> Reconciler {
        Reconciler::new(
            provider.clone(),
            store.clone(),
            Arc::new(SyncerSet::new(store.clone())),
        )
    }

    // =========================================================================
    // The diff deletes unseen rows but never touches local-only drafts
    // =========================================================================
    #[tokio::test]
    async fn orphan_deletion_spares_subscription_drafts() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let reconciler = engine(&provider, &store);

        let syncer = EntitySyncer::new(EntityKind::Subscription, store.clone());
        syncer
            .upsert(&json!({"id": "sub_live", "status": "active"}))
            .await
            .unwrap();
        syncer
            .upsert(&json!({"id": "sub_stale", "status": "active"}))
            .await
            .unwrap();
        store
            .upsert(&draft_subscription_update("sess-1", json!({})))
            .await
            .unwrap();

        provider.serve(
            EntityKind::Subscription,
            vec![json!({"id": "sub_live", "status": "active"})],
        );

        let report = reconciler.sync_kind(EntityKind::Subscription).await.unwrap();
        assert_eq!(report.deleted, 1);

        assert!(store
            .find(EntityKind::Subscription, "sub_live")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find(EntityKind::Subscription, "sub_stale")
            .await
            .unwrap()
            .is_none());
        assert!(
            store.find_subscription_draft("sess-1").await.unwrap().is_some(),
            "drafts have no remote counterpart and must survive the diff"
        );
    }

    // =========================================================================
    // A failed listing aborts the pass with zero deletions
    // =========================================================================
    #[tokio::test]
    async fn listing_failure_deletes_nothing() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let reconciler = engine(&provider, &store);

        EntitySyncer::new(EntityKind::Product, store.clone())
            .upsert(&json!({"id": "prod_1"}))
            .await
            .unwrap();
        provider.fail_listing(EntityKind::Product);

        let result = reconciler.sync_kind(EntityKind::Product).await;
        assert!(result.is_err());
        assert!(
            store
                .find(EntityKind::Product, "prod_1")
                .await
                .unwrap()
                .is_some(),
            "an incomplete survey must never drive deletions"
        );
    }

    // =========================================================================
    // Ownership left unresolved by out-of-order arrival heals on a full pass
    // =========================================================================
    #[tokio::test]
    async fn full_pass_heals_unresolved_ownership() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let reconciler = engine(&provider, &store);

        // Price arrives first, before its product is mirrored.
        EntitySyncer::new(EntityKind::Price, store.clone())
            .upsert(&json!({"id": "price_1", "product": "prod_1"}))
            .await
            .unwrap();
        let before = store
            .find(EntityKind::Price, "price_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.fields.as_price().unwrap().product_id, None);

        provider.serve(EntityKind::Product, vec![json!({"id": "prod_1"})]);
        provider.serve(
            EntityKind::Price,
            vec![json!({"id": "price_1", "product": "prod_1"})],
        );

        let outcomes = reconciler.sync_all().await;
        assert!(outcomes.iter().all(|o| o.succeeded()));

        let after = store
            .find(EntityKind::Price, "price_1")
            .await
            .unwrap()
            .unwrap();
        let owner = store
            .internal_id(EntityKind::Product, "prod_1")
            .await
            .unwrap();
        assert_eq!(after.fields.as_price().unwrap().product_id, owner);
    }
}

#[cfg(test)]
mod webhook_flow_tests {
    use crate::client::{WebhookVerifier, parse_event};
    use crate::error::SyncError;
    use crate::reconcile::SyncerSet;
    use crate::records::{EntityKind, SubscriptionPhase, CORRELATION_METADATA_KEY};
    use crate::store::MirrorStore;
    use crate::store_memory::MemoryMirrorStore;
    use crate::syncer::HookDecision;
    use crate::test_support::FakeProvider;
    use crate::webhooks::{DispatchOutcome, WebhookDispatcher};
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use std::sync::Arc;

    fn signed_header(secret: &str, payload: &[u8]) -> String {
        let ts = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    // =========================================================================
    // Only correctly signed payloads reach the mirror
    // =========================================================================
    #[tokio::test]
    async fn tampered_payloads_never_touch_the_store() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = WebhookDispatcher::new(
            WebhookVerifier::new("whsec_test"),
            provider.clone(),
            Arc::new(SyncerSet::new(store.clone())),
        );
        provider.serve(EntityKind::Product, vec![json!({"id": "prod_1"})]);

        let payload =
            json!({"id": "evt_1", "type": "product.created", "data": {"object": {"id": "prod_1"}}})
                .to_string();
        let header = signed_header("whsec_test", payload.as_bytes());

        // Body altered after signing.
        let tampered = payload.replace("prod_1", "prod_2");
        let err = dispatcher.verify(tampered.as_bytes(), &header).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSignature(_)));
        assert!(store
            .external_ids(EntityKind::Product)
            .await
            .unwrap()
            .is_empty());

        // The untouched payload goes through end to end.
        let event = dispatcher.verify(payload.as_bytes(), &header).unwrap();
        dispatcher.dispatch(&event).await.unwrap();
        assert!(store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .is_some());
    }

    // =========================================================================
    // A pre-save veto turns the event into a no-op, not an error
    // =========================================================================
    #[tokio::test]
    async fn vetoed_event_is_cancelled_cleanly() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let syncers = SyncerSet::new(store.clone())
            .with_before_save(EntityKind::Product, Arc::new(|_, _| HookDecision::Skip));
        let dispatcher = WebhookDispatcher::new(
            WebhookVerifier::new("whsec_test"),
            provider.clone(),
            Arc::new(syncers),
        );
        provider.serve(EntityKind::Product, vec![json!({"id": "prod_1"})]);

        let payload =
            json!({"id": "evt_1", "type": "product.created", "data": {"object": {"id": "prod_1"}}})
                .to_string();
        let event = parse_event(payload.as_bytes()).unwrap();
        let handled = dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(
            handled.outcome,
            DispatchOutcome::Cancelled {
                kind: EntityKind::Product,
                external_id: "prod_1".into()
            }
        );
        assert!(store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .is_none());
    }

    // =========================================================================
    // Draft promotion: the provider id replaces the draft key in place
    // =========================================================================
    #[tokio::test]
    async fn subscription_event_promotes_the_matching_draft() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = WebhookDispatcher::new(
            WebhookVerifier::new("whsec_test"),
            provider.clone(),
            Arc::new(SyncerSet::new(store.clone())),
        );

        let draft_write = store
            .upsert(&crate::records::draft_subscription_update(
                "sess-1",
                json!({"customer": "cus_1"}),
            ))
            .await
            .unwrap();
        let draft = store
            .find(EntityKind::Subscription, "draft_sess-1")
            .await
            .unwrap()
            .unwrap();

        provider.serve(
            EntityKind::Subscription,
            vec![json!({
                "id": "sub_1",
                "status": "active",
                "customer": "cus_1",
                "metadata": { CORRELATION_METADATA_KEY: "sess-1" }
            })],
        );

        let payload = json!({
            "id": "evt_1",
            "type": "customer.subscription.created",
            "data": {"object": {"id": "sub_1"}}
        })
        .to_string();
        let event = parse_event(payload.as_bytes()).unwrap();
        let handled = dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(
            handled.outcome,
            DispatchOutcome::Synced {
                kind: EntityKind::Subscription,
                external_id: "sub_1".into(),
                created: false
            }
        );

        let published = store
            .find(EntityKind::Subscription, "sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.internal_id, draft_write.internal_id);
        assert_eq!(published.created_at, draft.created_at);
        assert_eq!(
            published.fields.as_subscription().unwrap().phase,
            SubscriptionPhase::Published
        );
        assert!(store
            .find(EntityKind::Subscription, "draft_sess-1")
            .await
            .unwrap()
            .is_none());
    }
}
