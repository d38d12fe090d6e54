//! Webhook endpoint lifecycle on the provider side.
//!
//! Registration creates the remote endpoint subscribed to exactly the
//! event types the dispatcher routes, and persists the endpoint id plus
//! its signing secret so verification works across restarts without any
//! extra configuration.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::client::StripeClient;
use crate::error::{SyncError, SyncResult};
use crate::store::{MirrorStore, StoredRegistration};

/// Event types subscribed at registration. Kept in step with the
/// dispatcher's routing table.
pub const REGISTERED_EVENTS: &[&str] = &[
    "product.created",
    "product.updated",
    "product.deleted",
    "price.created",
    "price.updated",
    "price.deleted",
    "customer.created",
    "customer.updated",
    "customer.deleted",
    "customer.subscription.created",
    "customer.subscription.updated",
    "customer.subscription.deleted",
    "payment_method.attached",
    "payment_method.updated",
    "payment_method.automatically_updated",
    "payment_method.detached",
    "invoice.created",
    "invoice.updated",
    "invoice.finalized",
    "invoice.paid",
    "invoice.payment_failed",
    "invoice.voided",
    "invoice.deleted",
];

/// Remote endpoint state as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub external_id: String,
    pub url: String,
    pub status: String,
    pub enabled_events: Vec<String>,
}

pub struct WebhookRegistrar {
    client: StripeClient,
    store: Arc<dyn MirrorStore>,
}

impl WebhookRegistrar {
    pub fn new(client: StripeClient, store: Arc<dyn MirrorStore>) -> Self {
        Self { client, store }
    }

    /// Create the remote endpoint and persist its id and signing secret.
    pub async fn register(&self, url: &str) -> SyncResult<EndpointInfo> {
        let mut form: Vec<(String, String)> = vec![("url".to_string(), url.to_string())];
        for (i, event) in REGISTERED_EVENTS.iter().enumerate() {
            form.push((format!("enabled_events[{i}]"), (*event).to_string()));
        }

        let body = self.client.post_form("/v1/webhook_endpoints", &form).await?;
        let endpoint = endpoint_info(&body)?;
        // The secret is only disclosed in the creation response.
        let secret = body.get("secret").and_then(Value::as_str).ok_or_else(|| {
            SyncError::InvalidPayload("registration response missing secret".into())
        })?;

        self.store
            .save_registration(&StoredRegistration {
                endpoint_external_id: endpoint.external_id.clone(),
                signing_secret: secret.to_string(),
            })
            .await?;

        info!(endpoint = %endpoint.external_id, url = %url, "Registered webhook endpoint");
        Ok(endpoint)
    }

    /// Current remote state of the stored registration, if one exists.
    pub async fn inspect(&self) -> SyncResult<Option<EndpointInfo>> {
        let Some(registration) = self.store.load_registration().await? else {
            return Ok(None);
        };
        let body = self
            .client
            .get_json(
                &format!(
                    "/v1/webhook_endpoints/{}",
                    registration.endpoint_external_id
                ),
                &[],
            )
            .await?;
        endpoint_info(&body).map(Some)
    }

    /// Remove the remote endpoint and forget the stored registration.
    /// Returns false when nothing was registered. A remote 404 still
    /// clears the local row.
    pub async fn delete(&self) -> SyncResult<bool> {
        let Some(registration) = self.store.load_registration().await? else {
            return Ok(false);
        };

        match self
            .client
            .delete_resource(&format!(
                "/v1/webhook_endpoints/{}",
                registration.endpoint_external_id
            ))
            .await
        {
            Ok(_) => {}
            Err(SyncError::NotFound(_)) => {
                info!(
                    endpoint = %registration.endpoint_external_id,
                    "Endpoint already gone remotely"
                );
            }
            Err(err) => return Err(err),
        }

        self.store.clear_registration().await?;
        info!(endpoint = %registration.endpoint_external_id, "Unregistered webhook endpoint");
        Ok(true)
    }
}

/// Signing secret for inbound verification: explicit configuration wins,
/// else whatever a previous registration stored.
pub async fn resolve_signing_secret(
    configured: Option<&str>,
    store: &dyn MirrorStore,
) -> SyncResult<Option<String>> {
    if let Some(secret) = configured {
        return Ok(Some(secret.to_string()));
    }
    Ok(store
        .load_registration()
        .await?
        .map(|registration| registration.signing_secret))
}

fn endpoint_info(body: &Value) -> SyncResult<EndpointInfo> {
    let external_id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidPayload("endpoint response missing id".into()))?;
    let enabled_events = body
        .get("enabled_events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    Ok(EndpointInfo {
        external_id: external_id.to_string(),
        url: body
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        enabled_events,
    })
}
