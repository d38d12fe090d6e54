//! HTTPS access to the billing provider and webhook signature verification.
//!
//! The client is a thin wrapper: cursor-paginated listing, single fetch by
//! id, and the form-encoded calls the registration flow needs. Transport
//! failures (connect errors, 429, 5xx) are retried with jittered
//! exponential backoff before surfacing; provider rejections are not.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

use crate::error::{SyncError, SyncResult};
use crate::records::EntityKind;

type HmacSha256 = Hmac<Sha256>;

/// Fixed page size for list endpoints.
pub const PAGE_SIZE: usize = 100;

/// Seconds an event timestamp may differ from now before verification
/// rejects it as a replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Provider credentials and endpoint, read from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for inbound webhooks. When absent the stored
    /// registration row is the fallback.
    pub webhook_secret: Option<String>,
    pub api_base: String,
}

impl StripeConfig {
    pub fn from_env() -> SyncResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| SyncError::Config("STRIPE_SECRET_KEY must be set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
        let api_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// One page of a cursor-paginated list.
#[derive(Debug, Clone)]
pub struct Page {
    pub objects: Vec<Value>,
    pub has_more: bool,
}

impl Page {
    /// Cursor for the next call: the last object id on this page.
    pub fn next_cursor(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.objects
            .last()
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

/// Extra query filters for a list call.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    filters: Vec<(String, String)>,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, key: &str, value: &str) -> Self {
        self.filters.push((key.to_string(), value.to_string()));
        self
    }

    /// Value of a previously set filter, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.filters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Read access to the remote billing provider. Network I/O only, no local
/// mutation.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch one page of `kind`, at most [`PAGE_SIZE`] objects, with the
    /// kind's expansions applied.
    async fn list_page(
        &self,
        kind: EntityKind,
        params: &ListParams,
        cursor: Option<&str>,
    ) -> SyncResult<Page>;

    /// Fetch a single object by id with expansions. [`SyncError::NotFound`]
    /// when the id no longer exists remotely.
    async fn fetch(&self, kind: EntityKind, external_id: &str) -> SyncResult<Value>;

    /// Drain every page of `kind` into memory. Provider ordering is not
    /// creation order and must not be relied upon.
    async fn list_all(&self, kind: EntityKind, params: &ListParams) -> SyncResult<Vec<Value>> {
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_page(kind, params, cursor.as_deref()).await?;
            let next = page.next_cursor();
            objects.extend(page.objects);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(objects)
    }
}

/// Live HTTPS implementation of [`BillingProvider`].
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            secret_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> SyncResult<Self> {
        Self::new(&StripeConfig::from_env()?)
    }

    // Delays roughly 250ms, 2.5s, 5s before each of the three retries.
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(10)
            .factor(25)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(3)
    }

    pub(crate) async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> SyncResult<Value> {
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.get_json_once(path, query),
            SyncError::is_retryable,
        )
        .await
    }

    async fn get_json_once(&self, path: &str, query: &[(String, String)]) -> SyncResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("GET {path}: {e}")))?;

        Self::decode_response(path, response).await
    }

    /// Single-attempt POST with a form body. Not retried: the registration
    /// calls that use this are not idempotent.
    pub(crate) async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> SyncResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("POST {path}: {e}")))?;

        Self::decode_response(path, response).await
    }

    pub(crate) async fn delete_resource(&self, path: &str) -> SyncResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("DELETE {path}: {e}")))?;

        Self::decode_response(path, response).await
    }

    async fn decode_response(path: &str, response: reqwest::Response) -> SyncResult<Value> {
        let status = response.status();

        if status.is_success() {
            return response.json::<Value>().await.map_err(|e| {
                SyncError::Provider {
                    status: status.as_u16(),
                    message: format!("undecodable body from {path}: {e}"),
                }
            });
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(path.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            warn!(path = %path, status = %status, "Provider transport error");
            return Err(SyncError::Transport(format!("{path} returned {status}")));
        }

        error!(path = %path, status = %status, body = %body, "Provider rejected request");
        Err(SyncError::Provider {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn list_page(
        &self,
        kind: EntityKind,
        params: &ListParams,
        cursor: Option<&str>,
    ) -> SyncResult<Page> {
        let mut query: Vec<(String, String)> =
            vec![("limit".to_string(), PAGE_SIZE.to_string())];
        for (key, value) in &params.filters {
            query.push((key.clone(), value.clone()));
        }
        for expansion in kind.expansions() {
            // List responses nest objects under data[].
            query.push(("expand[]".to_string(), format!("data.{expansion}")));
        }
        if let Some(cursor) = cursor {
            query.push(("starting_after".to_string(), cursor.to_string()));
        }

        let body = self
            .get_json(&format!("/v1/{}", kind.api_path()), &query)
            .await?;

        let objects = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| SyncError::Provider {
                status: 200,
                message: format!("{kind} list response missing data array"),
            })?;
        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);

        debug!(kind = %kind, count = objects.len(), has_more = has_more, "Fetched provider page");
        Ok(Page { objects, has_more })
    }

    async fn fetch(&self, kind: EntityKind, external_id: &str) -> SyncResult<Value> {
        let query: Vec<(String, String)> = kind
            .expansions()
            .iter()
            .map(|e| ("expand[]".to_string(), (*e).to_string()))
            .collect();

        self.get_json(&format!("/v1/{}/{}", kind.api_path(), external_id), &query)
            .await
    }
}

/// A verified inbound event envelope.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: Option<String>,
    pub event_type: String,
    /// The embedded object, possibly partial. Never stored directly; used
    /// only to learn the external id before the full refetch.
    pub object: Value,
}

/// Verifies the provider's `t=<ts>,v1=<hex hmac>` signature header against
/// the raw body. The signed message is `"{t}.{body}"`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, payload: &[u8], signature_header: &str) -> SyncResult<WebhookEvent> {
        let (timestamp, candidates) = parse_signature_header(signature_header)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(SyncError::InvalidSignature(format!(
                "timestamp {timestamp} outside tolerance"
            )));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SyncError::InvalidSignature("unusable signing secret".into()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
        if !matched {
            return Err(SyncError::InvalidSignature(
                "no v1 signature matched".into(),
            ));
        }

        parse_event(payload)
    }
}

fn parse_signature_header(header: &str) -> SyncResult<(i64, Vec<String>)> {
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t.parse().ok();
        } else if let Some(sig) = part.strip_prefix("v1=") {
            candidates.push(sig.to_string());
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        SyncError::InvalidPayload("signature header missing or malformed t=".into())
    })?;
    if candidates.is_empty() {
        return Err(SyncError::InvalidPayload(
            "signature header has no v1= entry".into(),
        ));
    }
    Ok((timestamp, candidates))
}

/// Parse a raw body into the event envelope without verifying it. The
/// dispatcher only accepts events that came through [`WebhookVerifier`].
pub fn parse_event(payload: &[u8]) -> SyncResult<WebhookEvent> {
    let body: Value = serde_json::from_slice(payload)
        .map_err(|e| SyncError::InvalidPayload(format!("unparseable event body: {e}")))?;

    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidPayload("event body missing type".into()))?
        .to_string();
    let object = body
        .get("data")
        .and_then(|d| d.get("object"))
        .cloned()
        .ok_or_else(|| SyncError::InvalidPayload("event body missing data.object".into()))?;
    let id = body.get("id").and_then(Value::as_str).map(str::to_owned);

    Ok(WebhookEvent {
        id,
        event_type,
        object,
    })
}

// ============================================================================
// Tests
// ============================================================================



#[cfg(test)]
mod config_tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_requires_the_secret_key() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_API_BASE");
        assert!(matches!(
            StripeConfig::from_env().unwrap_err(),
            SyncError::Config(_)
        ));
    }

    #[test]
    #[serial]
    fn from_env_defaults_the_api_base() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::remove_var("STRIPE_API_BASE");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert!(config.webhook_secret.is_none());

        std::env::remove_var("STRIPE_SECRET_KEY");
    }
}
