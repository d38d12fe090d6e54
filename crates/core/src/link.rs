//! Cross-entity linkage resolution.
//!
//! Ownership (price to product) resolves to the owner's internal id and is
//! stored on the dependent row at upsert time. Customer linkage stays soft:
//! rows carry the provider's customer id as plain text and are matched on
//! demand, so out-of-order arrival never fails a write.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::records::{self, EntityKind, MirrorRecord};
use crate::store::MirrorStore;

#[derive(Clone)]
pub struct CrossEntityLinker {
    store: Arc<dyn MirrorStore>,
}

impl CrossEntityLinker {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    /// Internal id of the owning product, if mirrored. A miss is not an
    /// error; the ownership column heals on the next sync of the dependent.
    pub async fn resolve_product_owner(
        &self,
        product_external_id: Option<&str>,
    ) -> SyncResult<Option<Uuid>> {
        let Some(external_id) = product_external_id else {
            return Ok(None);
        };
        self.store
            .internal_id(EntityKind::Product, external_id)
            .await
    }

    /// Customers whose projected email matches, case-insensitively. Zero,
    /// one, or several records; the caller decides what a duplicate means.
    pub async fn customers_for_email(&self, email: &str) -> SyncResult<Vec<MirrorRecord>> {
        self.store.customers_by_email(email).await
    }

    /// Distinct products backing a subscription's line items, resolved
    /// through the mirrored prices. Unmirrored references are skipped.
    pub async fn products_for_subscription(
        &self,
        subscription: &MirrorRecord,
    ) -> SyncResult<Vec<MirrorRecord>> {
        let mut seen = HashSet::new();
        let mut products = Vec::new();

        for price_id in line_item_price_ids(&subscription.snapshot) {
            let Some(price) = self.store.find(EntityKind::Price, &price_id).await? else {
                continue;
            };
            let Some(product_id) = price
                .fields
                .as_price()
                .and_then(|f| f.product_external_id.clone())
            else {
                continue;
            };
            if !seen.insert(product_id.clone()) {
                continue;
            }
            if let Some(product) = self.store.find(EntityKind::Product, &product_id).await? {
                products.push(product);
            }
        }
        Ok(products)
    }
}

/// Price ids referenced by a subscription snapshot's line items.
pub(crate) fn line_item_price_ids(snapshot: &Value) -> Vec<String> {
    let Some(items) = snapshot.pointer("/items/data").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| records::reference_id(item, "price"))
        .collect()
}
