//! Shared test fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{BillingProvider, ListParams, Page};
use crate::error::{SyncError, SyncResult};
use crate::records::EntityKind;

/// Canned remote state, served unpaginated. Lists and fetches read the
/// same data, so refetch-after-event behaves like the live provider.
#[derive(Default)]
pub(crate) struct FakeProvider {
    lists: Mutex<HashMap<EntityKind, Vec<Value>>>,
    per_customer: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<EntityKind>>,
    pub(crate) seen_params: Mutex<Vec<(EntityKind, ListParams)>>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn serve(&self, kind: EntityKind, objects: Vec<Value>) {
        self.lists.lock().unwrap().insert(kind, objects);
    }

    pub(crate) fn serve_customer_methods(&self, customer: &str, objects: Vec<Value>) {
        self.per_customer
            .lock()
            .unwrap()
            .insert(customer.to_string(), objects);
    }

    pub(crate) fn fail_listing(&self, kind: EntityKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub(crate) fn remove(&self, kind: EntityKind, external_id: &str) {
        if let Some(objects) = self.lists.lock().unwrap().get_mut(&kind) {
            objects.retain(|o| o["id"] != external_id);
        }
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn list_page(
        &self,
        kind: EntityKind,
        params: &ListParams,
        _cursor: Option<&str>,
    ) -> SyncResult<Page> {
        self.seen_params.lock().unwrap().push((kind, params.clone()));
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(SyncError::Transport("listing unavailable".into()));
        }

        let objects = if kind == EntityKind::PaymentMethod {
            let customer = params.get("customer").unwrap_or_default();
            self.per_customer
                .lock()
                .unwrap()
                .get(customer)
                .cloned()
                .unwrap_or_default()
        } else {
            self.lists.lock().unwrap().get(&kind).cloned().unwrap_or_default()
        };
        Ok(Page {
            objects,
            has_more: false,
        })
    }

    async fn fetch(&self, kind: EntityKind, external_id: &str) -> SyncResult<Value> {
        if let Some(found) = self
            .lists
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|objects| objects.iter().find(|o| o["id"] == external_id))
        {
            return Ok(found.clone());
        }
        if kind == EntityKind::PaymentMethod {
            for objects in self.per_customer.lock().unwrap().values() {
                if let Some(found) = objects.iter().find(|o| o["id"] == external_id) {
                    return Ok(found.clone());
                }
            }
        }
        Err(SyncError::NotFound(format!(
            "/v1/{}/{}",
            kind.api_path(),
            external_id
        )))
    }
}
