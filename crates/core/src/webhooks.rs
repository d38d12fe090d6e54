//! Incremental sync driven by provider webhook events.
//!
//! Events are advisory: they carry the external id and little else worth
//! trusting. Every apply re-fetches the current object from the provider
//! and pushes it through the same syncer the bulk pass uses, so an event
//! can arrive late, twice, or out of order without corrupting the mirror.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{BillingProvider, WebhookEvent, WebhookVerifier};
use crate::error::{SyncError, SyncResult};
use crate::reconcile::SyncerSet;
use crate::records::{self, EntityKind};
use crate::syncer::UpsertOutcome;

/// What one event did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Synced {
        kind: EntityKind,
        external_id: String,
        created: bool,
    },
    Deleted {
        kind: EntityKind,
        external_id: String,
        existed: bool,
    },
    /// A pre-save hook vetoed the write.
    Cancelled {
        kind: EntityKind,
        external_id: String,
    },
    /// Event type nobody handles. Logged and acknowledged.
    Ignored { event_type: String },
}

/// A dispatched event paired with its outcome, as observers see it.
#[derive(Debug, Clone)]
pub struct HandledEvent {
    pub event_type: String,
    pub outcome: DispatchOutcome,
}

/// Called after each dispatched event, in registration order.
pub type DispatchObserver = Arc<dyn Fn(&HandledEvent) + Send + Sync>;

/// Verifies inbound webhook payloads and routes them to the syncers.
pub struct WebhookDispatcher {
    verifier: WebhookVerifier,
    provider: Arc<dyn BillingProvider>,
    syncers: Arc<SyncerSet>,
    observers: Vec<DispatchObserver>,
}

impl WebhookDispatcher {
    pub fn new(
        verifier: WebhookVerifier,
        provider: Arc<dyn BillingProvider>,
        syncers: Arc<SyncerSet>,
    ) -> Self {
        Self {
            verifier,
            provider,
            syncers,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: DispatchObserver) {
        self.observers.push(observer);
    }

    /// Check the signature header against the raw body and parse the
    /// envelope. No side effects; rejected payloads never reach dispatch.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> SyncResult<WebhookEvent> {
        self.verifier.verify(payload, signature_header)
    }

    /// Apply one verified event, then notify observers.
    pub async fn dispatch(&self, event: &WebhookEvent) -> SyncResult<HandledEvent> {
        let outcome = self.route(event).await?;
        let handled = HandledEvent {
            event_type: event.event_type.clone(),
            outcome,
        };
        for observer in &self.observers {
            observer(&handled);
        }
        Ok(handled)
    }

    async fn route(&self, event: &WebhookEvent) -> SyncResult<DispatchOutcome> {
        match event.event_type.as_str() {
            "product.created" | "product.updated" => {
                self.refetch_and_upsert(EntityKind::Product, event).await
            }
            "product.deleted" => self.delete(EntityKind::Product, event).await,

            "price.created" | "price.updated" => {
                self.refetch_and_upsert(EntityKind::Price, event).await
            }
            "price.deleted" => self.delete(EntityKind::Price, event).await,

            "customer.created" | "customer.updated" => {
                self.refetch_and_upsert(EntityKind::Customer, event).await
            }
            "customer.deleted" => self.delete(EntityKind::Customer, event).await,

            // Deletion here means cancellation. The refetch comes back with
            // status canceled and the row is kept; the mirror only drops a
            // subscription when the refetch itself 404s.
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                self.refetch_and_upsert(EntityKind::Subscription, event).await
            }

            "payment_method.attached"
            | "payment_method.updated"
            | "payment_method.automatically_updated" => {
                self.refetch_and_upsert(EntityKind::PaymentMethod, event).await
            }
            "payment_method.detached" => self.delete(EntityKind::PaymentMethod, event).await,

            "invoice.deleted" => self.delete(EntityKind::Invoice, event).await,
            t if t.starts_with("invoice.") => {
                self.refetch_and_upsert(EntityKind::Invoice, event).await
            }

            other => {
                debug!(event_type = %other, "Ignoring unhandled event type");
                Ok(DispatchOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        }
    }

    async fn refetch_and_upsert(
        &self,
        kind: EntityKind,
        event: &WebhookEvent,
    ) -> SyncResult<DispatchOutcome> {
        let external_id = records::external_id(&event.object)?;

        let snapshot = match self.provider.fetch(kind, &external_id).await {
            Ok(snapshot) => snapshot,
            // Gone remotely between the event and now.
            Err(SyncError::NotFound(_)) => {
                warn!(kind = %kind, external_id = %external_id, "Object gone on refetch, dropping mirror");
                let existed = self.syncers.for_kind(kind).delete(&external_id).await?;
                return Ok(DispatchOutcome::Deleted {
                    kind,
                    external_id,
                    existed,
                });
            }
            Err(err) => return Err(err),
        };

        match self.syncers.for_kind(kind).upsert(&snapshot).await? {
            UpsertOutcome::Applied { created, .. } => {
                info!(kind = %kind, external_id = %external_id, created, "Event mirrored");
                Ok(DispatchOutcome::Synced {
                    kind,
                    external_id,
                    created,
                })
            }
            UpsertOutcome::Cancelled => Ok(DispatchOutcome::Cancelled { kind, external_id }),
        }
    }

    async fn delete(
        &self,
        kind: EntityKind,
        event: &WebhookEvent,
    ) -> SyncResult<DispatchOutcome> {
        let external_id = records::external_id(&event.object)?;
        let existed = self.syncers.for_kind(kind).delete(&external_id).await?;
        Ok(DispatchOutcome::Deleted {
            kind,
            external_id,
            existed,
        })
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::records::SubscriptionStatus;
    use crate::store::MirrorStore;
    use crate::store_memory::MemoryMirrorStore;
    use crate::test_support::FakeProvider;
    use serde_json::json;
    use std::sync::Mutex;

    fn event(event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: Some("evt_1".into()),
            event_type: event_type.into(),
            object,
        }
    }

    fn dispatcher(
        provider: Arc<FakeProvider>,
        store: Arc<MemoryMirrorStore>,
    ) -> WebhookDispatcher {
        WebhookDispatcher::new(
            WebhookVerifier::new("whsec_test"),
            provider,
            Arc::new(SyncerSet::new(store)),
        )
    }

    #[tokio::test]
    async fn created_event_stores_the_refetched_object_not_the_event_body() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        provider.serve(
            EntityKind::Product,
            vec![json!({"id": "prod_1", "name": "Widget", "active": true})],
        );

        let handled = dispatcher
            .dispatch(&event("product.created", json!({"id": "prod_1"})))
            .await
            .unwrap();
        assert_eq!(
            handled.outcome,
            DispatchOutcome::Synced {
                kind: EntityKind::Product,
                external_id: "prod_1".into(),
                created: true
            }
        );

        let record = store
            .find(EntityKind::Product, "prod_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.snapshot["name"], "Widget");
    }

    #[tokio::test]
    async fn deleted_event_is_idempotent() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        provider.serve(EntityKind::Product, vec![json!({"id": "prod_1"})]);
        dispatcher
            .dispatch(&event("product.created", json!({"id": "prod_1"})))
            .await
            .unwrap();

        let first = dispatcher
            .dispatch(&event("product.deleted", json!({"id": "prod_1"})))
            .await
            .unwrap();
        let second = dispatcher
            .dispatch(&event("product.deleted", json!({"id": "prod_1"})))
            .await
            .unwrap();

        assert_eq!(
            first.outcome,
            DispatchOutcome::Deleted {
                kind: EntityKind::Product,
                external_id: "prod_1".into(),
                existed: true
            }
        );
        assert_eq!(
            second.outcome,
            DispatchOutcome::Deleted {
                kind: EntityKind::Product,
                external_id: "prod_1".into(),
                existed: false
            }
        );
    }

    #[tokio::test]
    async fn subscription_deletion_event_keeps_the_canceled_row() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        provider.serve(
            EntityKind::Subscription,
            vec![json!({"id": "sub_1", "status": "canceled"})],
        );

        dispatcher
            .dispatch(&event(
                "customer.subscription.deleted",
                json!({"id": "sub_1", "status": "canceled"}),
            ))
            .await
            .unwrap();

        let record = store
            .find(EntityKind::Subscription, "sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.fields.as_subscription().unwrap().status,
            SubscriptionStatus::Canceled
        );
    }

    #[tokio::test]
    async fn subscription_gone_on_refetch_is_dropped() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        provider.serve(
            EntityKind::Subscription,
            vec![json!({"id": "sub_1", "status": "active"})],
        );
        dispatcher
            .dispatch(&event(
                "customer.subscription.created",
                json!({"id": "sub_1"}),
            ))
            .await
            .unwrap();

        provider.remove(EntityKind::Subscription, "sub_1");
        let handled = dispatcher
            .dispatch(&event(
                "customer.subscription.deleted",
                json!({"id": "sub_1"}),
            ))
            .await
            .unwrap();

        assert_eq!(
            handled.outcome,
            DispatchOutcome::Deleted {
                kind: EntityKind::Subscription,
                external_id: "sub_1".into(),
                existed: true
            }
        );
        assert!(store
            .find(EntityKind::Subscription, "sub_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn detached_payment_method_is_removed() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        provider.serve_customer_methods(
            "cus_1",
            vec![json!({"id": "pm_1", "customer": "cus_1"})],
        );
        dispatcher
            .dispatch(&event("payment_method.attached", json!({"id": "pm_1"})))
            .await
            .unwrap();
        assert!(store
            .find(EntityKind::PaymentMethod, "pm_1")
            .await
            .unwrap()
            .is_some());

        dispatcher
            .dispatch(&event("payment_method.detached", json!({"id": "pm_1"})))
            .await
            .unwrap();
        assert!(store
            .find(EntityKind::PaymentMethod, "pm_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged_and_ignored() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let dispatcher = dispatcher(provider.clone(), store.clone());

        let handled = dispatcher
            .dispatch(&event(
                "charge.succeeded",
                json!({"id": "ch_1", "amount": 1000}),
            ))
            .await
            .unwrap();

        assert_eq!(
            handled.outcome,
            DispatchOutcome::Ignored {
                event_type: "charge.succeeded".into()
            }
        );
    }

    #[tokio::test]
    async fn observers_run_after_every_dispatch() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryMirrorStore::new());
        let mut dispatcher = dispatcher(provider.clone(), store.clone());

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        dispatcher.add_observer(Arc::new(move |handled| {
            sink.lock().unwrap().push(handled.event_type.clone());
        }));

        provider.serve(EntityKind::Product, vec![json!({"id": "prod_1"})]);
        dispatcher
            .dispatch(&event("product.created", json!({"id": "prod_1"})))
            .await
            .unwrap();
        dispatcher
            .dispatch(&event("charge.succeeded", json!({"id": "ch_1"})))
            .await
            .unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["product.created", "charge.succeeded"]
        );
    }
}
