//! Entity kinds, projected fields, and snapshot field extraction.
//!
//! A mirrored record is an opaque JSON snapshot plus a handful of typed
//! columns projected out of it once at upsert time. Queries hit the typed
//! columns, never the JSON.

use std::fmt;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Key under the provider `metadata` map carrying the checkout-session uid
/// used to match a subscription to a local draft.
pub const CORRELATION_METADATA_KEY: &str = "checkout_session_uid";

/// External-id prefix for local draft subscriptions, which have no
/// provider-assigned id yet.
pub const DRAFT_ID_PREFIX: &str = "draft_";

/// The six mirrored entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Product,
    Price,
    Subscription,
    Customer,
    PaymentMethod,
    Invoice,
}

impl EntityKind {
    /// All kinds in reconciliation order: owners before dependents, so
    /// ownership ids resolve on the first pass.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Product,
        EntityKind::Price,
        EntityKind::Customer,
        EntityKind::PaymentMethod,
        EntityKind::Subscription,
        EntityKind::Invoice,
    ];

    /// Table-name stem; also the CLI spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Price => "price",
            EntityKind::Subscription => "subscription",
            EntityKind::Customer => "customer",
            EntityKind::PaymentMethod => "payment_method",
            EntityKind::Invoice => "invoice",
        }
    }

    /// Provider list/fetch endpoint path segment.
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Price => "prices",
            EntityKind::Subscription => "subscriptions",
            EntityKind::Customer => "customers",
            EntityKind::PaymentMethod => "payment_methods",
            EntityKind::Invoice => "invoices",
        }
    }

    /// Sub-resource expansions requested on every fetch so snapshots are
    /// stored complete. Inbound webhook payloads omit these, which is why
    /// the dispatcher re-fetches instead of storing event bodies.
    pub fn expansions(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Product => &["default_price"],
            EntityKind::Price => &["tiers"],
            EntityKind::Subscription => &["latest_invoice"],
            _ => &[],
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "product" | "products" => Some(EntityKind::Product),
            "price" | "prices" => Some(EntityKind::Price),
            "subscription" | "subscriptions" => Some(EntityKind::Subscription),
            "customer" | "customers" => Some(EntityKind::Customer),
            "payment_method" | "payment_methods" => Some(EntityKind::PaymentMethod),
            "invoice" | "invoices" => Some(EntityKind::Invoice),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog lifecycle derived from the provider's `active` flag. Archived
/// records stay locally enabled and queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStatus {
    Live,
    Archived,
}

impl CatalogStatus {
    pub fn from_active(active: bool) -> Self {
        if active {
            CatalogStatus::Live
        } else {
            CatalogStatus::Archived
        }
    }

    /// Parse the stored column value.
    pub fn parse(s: &str) -> Self {
        match s {
            "archived" => CatalogStatus::Archived,
            _ => CatalogStatus::Live,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogStatus::Live => "live",
            CatalogStatus::Archived => "archived",
        }
    }
}

/// Subscription lifecycle. Canceled subscriptions keep their row; the
/// status alone distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Live,
    Scheduled,
    Canceled,
}

impl SubscriptionStatus {
    /// Map the provider's status string onto the local vocabulary.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Scheduled,
            // active, trialing, past_due, unpaid, paused
            _ => SubscriptionStatus::Live,
        }
    }

    /// Parse the stored column value.
    pub fn parse(s: &str) -> Self {
        match s {
            "canceled" => SubscriptionStatus::Canceled,
            "scheduled" => SubscriptionStatus::Scheduled,
            _ => SubscriptionStatus::Live,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Live => "live",
            SubscriptionStatus::Scheduled => "scheduled",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

/// Draft lifecycle for subscriptions. A draft is a local placeholder keyed
/// by correlation id, created ahead of the provider webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Draft,
    Published,
}

impl SubscriptionPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "draft" => SubscriptionPhase::Draft,
            _ => SubscriptionPhase::Published,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPhase::Draft => "draft",
            SubscriptionPhase::Published => "published",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductFields {
    pub status: CatalogStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceFields {
    pub status: CatalogStatus,
    pub currency: Option<String>,
    /// Provider value, `one_time` or `recurring`.
    pub price_type: Option<String>,
    pub product_external_id: Option<String>,
    /// Owning product's internal id, resolved at upsert. None until the
    /// product has been mirrored.
    pub product_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFields {
    pub status: SubscriptionStatus,
    pub phase: SubscriptionPhase,
    pub correlation_id: Option<String>,
    pub customer_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerFields {
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodFields {
    pub customer_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceFields {
    /// Provider status string, stored as-is.
    pub status: Option<String>,
    pub customer_external_id: Option<String>,
}

/// The typed columns projected out of a snapshot, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projections {
    Product(ProductFields),
    Price(PriceFields),
    Subscription(SubscriptionFields),
    Customer(CustomerFields),
    PaymentMethod(PaymentMethodFields),
    Invoice(InvoiceFields),
}

impl Projections {
    /// Project the indexed columns out of a raw snapshot. Ownership ids
    /// that need a store lookup (price → product) start out unresolved.
    pub fn from_snapshot(kind: EntityKind, snapshot: &Value) -> Projections {
        match kind {
            EntityKind::Product => Projections::Product(ProductFields {
                status: CatalogStatus::from_active(
                    bool_field(snapshot, "active").unwrap_or(true),
                ),
            }),
            EntityKind::Price => Projections::Price(PriceFields {
                status: CatalogStatus::from_active(
                    bool_field(snapshot, "active").unwrap_or(true),
                ),
                currency: str_field(snapshot, "currency"),
                price_type: str_field(snapshot, "type"),
                product_external_id: reference_id(snapshot, "product"),
                product_id: None,
            }),
            EntityKind::Subscription => Projections::Subscription(SubscriptionFields {
                status: str_field(snapshot, "status")
                    .as_deref()
                    .map(SubscriptionStatus::from_provider)
                    .unwrap_or(SubscriptionStatus::Live),
                phase: SubscriptionPhase::Published,
                correlation_id: metadata_field(snapshot, CORRELATION_METADATA_KEY),
                customer_external_id: reference_id(snapshot, "customer"),
            }),
            EntityKind::Customer => Projections::Customer(CustomerFields {
                email: str_field(snapshot, "email"),
            }),
            EntityKind::PaymentMethod => Projections::PaymentMethod(PaymentMethodFields {
                customer_external_id: reference_id(snapshot, "customer"),
            }),
            EntityKind::Invoice => Projections::Invoice(InvoiceFields {
                status: str_field(snapshot, "status"),
                customer_external_id: reference_id(snapshot, "customer"),
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Projections::Product(_) => EntityKind::Product,
            Projections::Price(_) => EntityKind::Price,
            Projections::Subscription(_) => EntityKind::Subscription,
            Projections::Customer(_) => EntityKind::Customer,
            Projections::PaymentMethod(_) => EntityKind::PaymentMethod,
            Projections::Invoice(_) => EntityKind::Invoice,
        }
    }

    pub fn as_price(&self) -> Option<&PriceFields> {
        match self {
            Projections::Price(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_price_mut(&mut self) -> Option<&mut PriceFields> {
        match self {
            Projections::Price(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&SubscriptionFields> {
        match self {
            Projections::Subscription(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_customer(&self) -> Option<&CustomerFields> {
        match self {
            Projections::Customer(fields) => Some(fields),
            _ => None,
        }
    }
}

/// One mirrored entity: the index row and data row joined.
#[derive(Debug, Clone)]
pub struct MirrorRecord {
    /// Locally assigned surrogate id. Stable across upserts.
    pub internal_id: Uuid,
    pub external_id: String,
    pub snapshot: Value,
    pub fields: Projections,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// The attribute set one upsert applies.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub external_id: String,
    pub snapshot: Value,
    pub fields: Projections,
}

/// Build the write for a draft subscription placeholder. The external id is
/// synthesized from the correlation id; promotion re-keys it once the
/// provider-assigned id arrives.
pub fn draft_subscription_update(correlation_id: &str, snapshot: Value) -> RecordUpdate {
    let customer_external_id = reference_id(&snapshot, "customer");
    RecordUpdate {
        external_id: format!("{DRAFT_ID_PREFIX}{correlation_id}"),
        snapshot,
        fields: Projections::Subscription(SubscriptionFields {
            status: SubscriptionStatus::Scheduled,
            phase: SubscriptionPhase::Draft,
            correlation_id: Some(correlation_id.to_string()),
            customer_external_id,
        }),
    }
}

/// Extract the provider-assigned object id.
pub fn external_id(snapshot: &Value) -> SyncResult<String> {
    str_field(snapshot, "id")
        .ok_or_else(|| SyncError::InvalidPayload("remote object has no id".into()))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)?.as_str().map(str::to_owned)
}

fn bool_field(v: &Value, key: &str) -> Option<bool> {
    v.get(key)?.as_bool()
}

/// The provider returns references either as a bare id string or, when
/// expanded, as the full object carrying its own `id`.
pub(crate) fn reference_id(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("id")?.as_str().map(str::to_owned),
        _ => None,
    }
}

fn metadata_field(v: &Value, key: &str) -> Option<String> {
    v.get("metadata")?.get(key)?.as_str().map(str::to_owned)
}
