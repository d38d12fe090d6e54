//! Bulk reconciliation.
//!
//! A pass over one kind lists everything the provider has, mirrors each
//! object, then deletes local records absent from the listing. The listing
//! is the authority on deletions, which is exactly why a listing failure
//! aborts the pass before the delete phase ever runs: an incomplete survey
//! must never drive deletions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::{BillingProvider, ListParams};
use crate::error::{SyncError, SyncResult};
use crate::records::{self, EntityKind};
use crate::store::MirrorStore;
use crate::syncer::{BeforeSaveHook, EntitySyncer, UpsertOutcome};

/// The per-kind syncers, one each, built over a shared store.
pub struct SyncerSet {
    pub product: EntitySyncer,
    pub price: EntitySyncer,
    pub customer: EntitySyncer,
    pub payment_method: EntitySyncer,
    pub subscription: EntitySyncer,
    pub invoice: EntitySyncer,
}

impl SyncerSet {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self {
            product: EntitySyncer::new(EntityKind::Product, store.clone()),
            price: EntitySyncer::new(EntityKind::Price, store.clone()),
            customer: EntitySyncer::new(EntityKind::Customer, store.clone()),
            payment_method: EntitySyncer::new(EntityKind::PaymentMethod, store.clone()),
            subscription: EntitySyncer::new(EntityKind::Subscription, store.clone()),
            invoice: EntitySyncer::new(EntityKind::Invoice, store),
        }
    }

    /// Install a pre-save hook on one kind's syncer.
    pub fn with_before_save(mut self, kind: EntityKind, hook: BeforeSaveHook) -> Self {
        let slot = match kind {
            EntityKind::Product => &mut self.product,
            EntityKind::Price => &mut self.price,
            EntityKind::Customer => &mut self.customer,
            EntityKind::PaymentMethod => &mut self.payment_method,
            EntityKind::Subscription => &mut self.subscription,
            EntityKind::Invoice => &mut self.invoice,
        };
        *slot = slot.clone().with_before_save(hook);
        self
    }

    pub fn for_kind(&self, kind: EntityKind) -> &EntitySyncer {
        match kind {
            EntityKind::Product => &self.product,
            EntityKind::Price => &self.price,
            EntityKind::Customer => &self.customer,
            EntityKind::PaymentMethod => &self.payment_method,
            EntityKind::Subscription => &self.subscription,
            EntityKind::Invoice => &self.invoice,
        }
    }
}

/// Counters for one kind's pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub deleted: usize,
    pub delete_failed: usize,
    pub elapsed: Duration,
}

impl SyncReport {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fetched: 0,
            created: 0,
            updated: 0,
            cancelled: 0,
            failed: 0,
            deleted: 0,
            delete_failed: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// True when every fetched object was applied and every orphan removed.
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.delete_failed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} fetched, {} created, {} updated, {} cancelled, {} failed, \
             {} deleted, {} delete failures in {:.1?}",
            self.kind,
            self.fetched,
            self.created,
            self.updated,
            self.cancelled,
            self.failed,
            self.deleted,
            self.delete_failed,
            self.elapsed
        )
    }
}

/// Terminal result for one kind within a full pass.
#[derive(Debug)]
pub enum KindOutcome {
    Completed(SyncReport),
    /// The pass aborted before its delete phase. The mirror keeps its
    /// previous contents for this kind.
    Failed { kind: EntityKind, error: SyncError },
}

impl KindOutcome {
    pub fn kind(&self) -> EntityKind {
        match self {
            KindOutcome::Completed(report) => report.kind,
            KindOutcome::Failed { kind, .. } => *kind,
        }
    }

    pub fn succeeded(&self) -> bool {
        match self {
            KindOutcome::Completed(report) => report.succeeded(),
            KindOutcome::Failed { .. } => false,
        }
    }
}

/// Drives full-sync passes over the provider.
pub struct Reconciler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn MirrorStore>,
    syncers: Arc<SyncerSet>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn MirrorStore>,
        syncers: Arc<SyncerSet>,
    ) -> Self {
        Self {
            provider,
            store,
            syncers,
        }
    }

    /// Reconcile every kind in dependency order, owners before dependents.
    /// One kind failing does not stop the rest.
    pub async fn sync_all(&self) -> Vec<KindOutcome> {
        let mut outcomes = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let outcome = match self.sync_kind(kind).await {
                Ok(report) => {
                    info!(%report, "Reconciliation pass finished");
                    KindOutcome::Completed(report)
                }
                Err(error) => {
                    error!(kind = %kind, error = %error, "Reconciliation pass aborted");
                    KindOutcome::Failed { kind, error }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Reconcile a single kind end to end.
    pub async fn sync_kind(&self, kind: EntityKind) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(kind);
        let mut seen = HashSet::new();

        match kind {
            // The default listing omits canceled subscriptions, which the
            // diff would then delete. Ask for every status. Applied page by
            // page rather than materialized: the collection is unbounded
            // and each item carries its expanded latest invoice.
            EntityKind::Subscription => {
                let params = ListParams::new().filter("status", "all");
                let mut cursor: Option<String> = None;
                loop {
                    let page = self.provider.list_page(kind, &params, cursor.as_deref()).await?;
                    let next = page.next_cursor();
                    self.apply_batch(kind, &page.objects, &mut seen, &mut report)
                        .await;
                    match next {
                        Some(c) => cursor = Some(c),
                        None => break,
                    }
                }
            }
            EntityKind::PaymentMethod => {
                self.sync_payment_methods(&mut seen, &mut report).await?;
            }
            _ => {
                let objects = self.provider.list_all(kind, &ListParams::new()).await?;
                self.apply_batch(kind, &objects, &mut seen, &mut report).await;
            }
        }

        self.delete_orphans(kind, &seen, &mut report).await?;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// There is no global payment-method listing; walk the mirrored
    /// customers and list each one's methods.
    async fn sync_payment_methods(
        &self,
        seen: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let customers = self.store.external_ids(EntityKind::Customer).await?;
        for customer_id in customers {
            let params = ListParams::new().filter("customer", &customer_id);
            let objects = match self
                .provider
                .list_all(EntityKind::PaymentMethod, &params)
                .await
            {
                Ok(objects) => objects,
                // A customer deleted remotely mid-pass is not a survey
                // failure; its methods fall out as orphans.
                Err(SyncError::NotFound(_)) => {
                    warn!(customer = %customer_id, "Customer gone during payment-method listing");
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.apply_batch(EntityKind::PaymentMethod, &objects, seen, report)
                .await;
        }
        Ok(())
    }

    async fn apply_batch(
        &self,
        kind: EntityKind,
        objects: &[Value],
        seen: &mut HashSet<String>,
        report: &mut SyncReport,
    ) {
        let syncer = self.syncers.for_kind(kind);
        for object in objects {
            report.fetched += 1;

            // Marked seen before the write: a vetoed or failed record is
            // still present remotely and must not be diff-deleted.
            match records::external_id(object) {
                Ok(id) => {
                    seen.insert(id);
                }
                Err(err) => {
                    warn!(kind = %kind, error = %err, "Skipping unidentifiable object");
                    report.failed += 1;
                    continue;
                }
            }

            match syncer.upsert(object).await {
                Ok(UpsertOutcome::Applied { created: true, .. }) => report.created += 1,
                Ok(UpsertOutcome::Applied { created: false, .. }) => report.updated += 1,
                Ok(UpsertOutcome::Cancelled) => report.cancelled += 1,
                Err(err) => {
                    error!(kind = %kind, error = %err, "Failed to mirror record");
                    report.failed += 1;
                }
            }
        }
    }

    async fn delete_orphans(
        &self,
        kind: EntityKind,
        seen: &HashSet<String>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let syncer = self.syncers.for_kind(kind);
        for external_id in self.store.external_ids(kind).await? {
            if seen.contains(&external_id) {
                continue;
            }
            match syncer.delete(&external_id).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(
                        kind = %kind,
                        external_id = %external_id,
                        error = %err,
                        "Failed to delete orphan"
                    );
                    report.delete_failed += 1;
                }
            }
        }
        Ok(())
    }
}
