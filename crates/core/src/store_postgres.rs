//! Postgres [`MirrorStore`] over the paired `{kind}_index` / `{kind}_data`
//! tables.
//!
//! The index row carries the stable internal id and is only ever inserted;
//! the data row is fully replaced on every upsert. Each write is one
//! transaction so a record is never visible half-updated.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::records::{
    CatalogStatus, CustomerFields, EntityKind, InvoiceFields, MirrorRecord, PaymentMethodFields,
    PriceFields, ProductFields, Projections, RecordUpdate, SubscriptionFields, SubscriptionPhase,
    SubscriptionStatus,
};
use crate::store::{MirrorStore, StoredRegistration, UpsertWrite};

#[derive(Clone)]
pub struct PgMirrorStore {
    pool: PgPool,
}

impl PgMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-or-replace the data row inside an open transaction. The
    /// matching index row must already exist.
    async fn write_data(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        update: &RecordUpdate,
    ) -> SyncResult<()> {
        match &update.fields {
            Projections::Product(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO product_data (external_id, snapshot, status)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        status = EXCLUDED.status,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(fields.status.as_str())
                .execute(&mut **tx)
                .await?;
            }
            Projections::Price(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO price_data
                        (external_id, snapshot, status, currency, price_type,
                         product_external_id, product_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        status = EXCLUDED.status,
                        currency = EXCLUDED.currency,
                        price_type = EXCLUDED.price_type,
                        product_external_id = EXCLUDED.product_external_id,
                        product_id = EXCLUDED.product_id,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(fields.status.as_str())
                .bind(&fields.currency)
                .bind(&fields.price_type)
                .bind(&fields.product_external_id)
                .bind(fields.product_id)
                .execute(&mut **tx)
                .await?;
            }
            Projections::Subscription(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO subscription_data
                        (external_id, snapshot, status, phase, correlation_id,
                         customer_external_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        status = EXCLUDED.status,
                        phase = EXCLUDED.phase,
                        correlation_id = EXCLUDED.correlation_id,
                        customer_external_id = EXCLUDED.customer_external_id,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(fields.status.as_str())
                .bind(fields.phase.as_str())
                .bind(&fields.correlation_id)
                .bind(&fields.customer_external_id)
                .execute(&mut **tx)
                .await?;
            }
            Projections::Customer(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO customer_data (external_id, snapshot, email)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        email = EXCLUDED.email,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(&fields.email)
                .execute(&mut **tx)
                .await?;
            }
            Projections::PaymentMethod(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO payment_method_data
                        (external_id, snapshot, customer_external_id)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        customer_external_id = EXCLUDED.customer_external_id,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(&fields.customer_external_id)
                .execute(&mut **tx)
                .await?;
            }
            Projections::Invoice(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO invoice_data
                        (external_id, snapshot, status, customer_external_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (external_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        status = EXCLUDED.status,
                        customer_external_id = EXCLUDED.customer_external_id,
                        updated_at = NOW()
                    "#,
                )
                .bind(&update.external_id)
                .bind(&update.snapshot)
                .bind(&fields.status)
                .bind(&fields.customer_external_id)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

/// Projection columns selected alongside the common ones, per kind.
fn projection_columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "d.status",
        EntityKind::Price => {
            "d.status, d.currency, d.price_type, d.product_external_id, d.product_id"
        }
        EntityKind::Subscription => {
            "d.status, d.phase, d.correlation_id, d.customer_external_id"
        }
        EntityKind::Customer => "d.email",
        EntityKind::PaymentMethod => "d.customer_external_id",
        EntityKind::Invoice => "d.status, d.customer_external_id",
    }
}

fn record_query(kind: EntityKind, where_clause: &str) -> String {
    format!(
        "SELECT i.id, i.external_id, d.snapshot, {cols}, i.created_at, d.updated_at \
         FROM {kind}_index i \
         JOIN {kind}_data d ON d.external_id = i.external_id \
         {where_clause}",
        cols = projection_columns(kind),
        kind = kind.as_str(),
    )
}

fn record_from_row(kind: EntityKind, row: &PgRow) -> SyncResult<MirrorRecord> {
    let fields = match kind {
        EntityKind::Product => Projections::Product(ProductFields {
            status: CatalogStatus::parse(&row.try_get::<String, _>("status")?),
        }),
        EntityKind::Price => Projections::Price(PriceFields {
            status: CatalogStatus::parse(&row.try_get::<String, _>("status")?),
            currency: row.try_get("currency")?,
            price_type: row.try_get("price_type")?,
            product_external_id: row.try_get("product_external_id")?,
            product_id: row.try_get("product_id")?,
        }),
        EntityKind::Subscription => Projections::Subscription(SubscriptionFields {
            status: SubscriptionStatus::parse(&row.try_get::<String, _>("status")?),
            phase: SubscriptionPhase::parse(&row.try_get::<String, _>("phase")?),
            correlation_id: row.try_get("correlation_id")?,
            customer_external_id: row.try_get("customer_external_id")?,
        }),
        EntityKind::Customer => Projections::Customer(CustomerFields {
            email: row.try_get("email")?,
        }),
        EntityKind::PaymentMethod => Projections::PaymentMethod(PaymentMethodFields {
            customer_external_id: row.try_get("customer_external_id")?,
        }),
        EntityKind::Invoice => Projections::Invoice(InvoiceFields {
            status: row.try_get("status")?,
            customer_external_id: row.try_get("customer_external_id")?,
        }),
    };

    Ok(MirrorRecord {
        internal_id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        snapshot: row.try_get("snapshot")?,
        fields,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    async fn find(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> SyncResult<Option<MirrorRecord>> {
        let row = sqlx::query(&record_query(kind, "WHERE i.external_id = $1"))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_row(kind, &row)).transpose()
    }

    async fn upsert(&self, update: &RecordUpdate) -> SyncResult<UpsertWrite> {
        let kind = update.fields.kind();
        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> = sqlx::query_scalar(&format!(
            "SELECT id FROM {}_index WHERE external_id = $1",
            kind.as_str()
        ))
        .bind(&update.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let internal_id: Uuid = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {}_index (external_id) VALUES ($1)
            ON CONFLICT (external_id) DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
            kind.as_str()
        ))
        .bind(&update.external_id)
        .fetch_one(&mut *tx)
        .await?;

        self.write_data(&mut tx, update).await?;
        tx.commit().await?;

        Ok(UpsertWrite {
            internal_id,
            created: existing.is_none(),
        })
    }

    async fn delete(&self, kind: EntityKind, external_id: &str) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        if kind == EntityKind::Product {
            // Owned prices go with the product. Only resolved ownership
            // counts; price_data rows cascade off their own index.
            sqlx::query(
                r#"
                DELETE FROM price_index
                WHERE external_id IN (
                    SELECT pd.external_id
                    FROM price_data pd
                    JOIN product_index pi ON pd.product_id = pi.id
                    WHERE pi.external_id = $1
                )
                "#,
            )
            .bind(external_id)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {}_index WHERE external_id = $1",
            kind.as_str()
        ))
        .bind(external_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn external_ids(&self, kind: EntityKind) -> SyncResult<Vec<String>> {
        // Drafts stay out of the diff: they have no remote counterpart.
        let sql = match kind {
            EntityKind::Subscription => {
                "SELECT external_id FROM subscription_data WHERE phase = 'published'".to_string()
            }
            _ => format!("SELECT external_id FROM {}_data", kind.as_str()),
        };
        Ok(sqlx::query_scalar(&sql).fetch_all(&self.pool).await?)
    }

    async fn internal_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> SyncResult<Option<Uuid>> {
        Ok(sqlx::query_scalar(&format!(
            "SELECT id FROM {}_index WHERE external_id = $1",
            kind.as_str()
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn customers_by_email(&self, email: &str) -> SyncResult<Vec<MirrorRecord>> {
        let rows = sqlx::query(&record_query(
            EntityKind::Customer,
            "WHERE LOWER(d.email) = LOWER($1)",
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| record_from_row(EntityKind::Customer, row))
            .collect()
    }

    async fn prices_for_product(&self, product_id: Uuid) -> SyncResult<Vec<MirrorRecord>> {
        let rows = sqlx::query(&record_query(EntityKind::Price, "WHERE d.product_id = $1"))
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| record_from_row(EntityKind::Price, row))
            .collect()
    }

    async fn find_subscription_draft(
        &self,
        correlation_id: &str,
    ) -> SyncResult<Option<MirrorRecord>> {
        let row = sqlx::query(&record_query(
            EntityKind::Subscription,
            "WHERE d.phase = 'draft' AND d.correlation_id = $1",
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| record_from_row(EntityKind::Subscription, &row))
            .transpose()
    }

    async fn promote_subscription_draft(
        &self,
        draft_external_id: &str,
        update: &RecordUpdate,
    ) -> SyncResult<Option<UpsertWrite>> {
        let mut tx = self.pool.begin().await?;

        // Re-keying the index row drags the data row along via
        // ON UPDATE CASCADE, so the write_data below hits the conflict arm.
        let internal_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE subscription_index
            SET external_id = $1, updated_at = NOW()
            WHERE external_id = $2
            RETURNING id
            "#,
        )
        .bind(&update.external_id)
        .bind(draft_external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(internal_id) = internal_id else {
            return Ok(None);
        };

        self.write_data(&mut tx, update).await?;
        tx.commit().await?;

        Ok(Some(UpsertWrite {
            internal_id,
            created: false,
        }))
    }

    async fn load_registration(&self) -> SyncResult<Option<StoredRegistration>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT endpoint_external_id, signing_secret FROM webhook_registration",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(endpoint_external_id, signing_secret)| StoredRegistration {
            endpoint_external_id,
            signing_secret,
        }))
    }

    async fn save_registration(&self, registration: &StoredRegistration) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_registration (id, endpoint_external_id, signing_secret)
            VALUES (TRUE, $1, $2)
            ON CONFLICT (id) DO UPDATE SET
                endpoint_external_id = EXCLUDED.endpoint_external_id,
                signing_secret = EXCLUDED.signing_secret,
                registered_at = NOW()
            "#,
        )
        .bind(&registration.endpoint_external_id)
        .bind(&registration.signing_secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_registration(&self) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM webhook_registration")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
