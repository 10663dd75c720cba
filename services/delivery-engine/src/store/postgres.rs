// PostgreSQL delivery store
// Row lock + update + ledger append run inside one transaction

use super::{DeliveryStore, UpdateGuard};
use crate::config::DatabaseConfig;
use crate::errors::{DeliveryError, Result};
use crate::models::{Account, Delivery, DeliveryFilter, DeliverySnapshot, DeliveryStatus, TrackingEvent};
use crate::status_machine::DeliveryChange;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const DELIVERY_COLUMNS: &str = "id, order_id, customer_id, courier_id, status, started_at, \
     delivered_at, estimated_delivery_time, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, delivery_id, status, latitude, longitude, notes, created_at";

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    display_name: String,
    role: String,
}

impl TryFrom<AccountRow> for Account {
    type Error = DeliveryError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: row.id,
            display_name: row.display_name,
            role: row.role.parse().map_err(DeliveryError::Internal)?,
        })
    }
}

pub struct PgDeliveryStore {
    pool: PgPool,
}

impl PgDeliveryStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DeliveryError::Internal(format!("Migration failed: {}", e)))
    }
}

/// Ledger append. Only ever called inside `apply_update`'s transaction.
async fn append_tracking_event(conn: &mut PgConnection, event: &TrackingEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO delivery_tracking_events
            (id, delivery_id, status, latitude, longitude, notes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.id)
    .bind(event.delivery_id)
    .bind(event.status)
    .bind(event.latitude)
    .bind(event.longitude)
    .bind(&event.notes)
    .bind(event.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

async fn latest_events(conn: &mut PgConnection, delivery_id: Uuid, limit: i64) -> Result<Vec<TrackingEvent>> {
    let events = sqlx::query_as::<_, TrackingEvent>(&format!(
        "SELECT {} FROM delivery_tracking_events WHERE delivery_id = $1 \
         ORDER BY created_at DESC, id DESC LIMIT $2",
        EVENT_COLUMNS
    ))
    .bind(delivery_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(events)
}

#[async_trait]
impl DeliveryStore for PgDeliveryStore {
    async fn insert_delivery(&self, delivery: &Delivery) -> Result<Delivery> {
        let inserted = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            INSERT INTO deliveries ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING {cols}
            "#,
            cols = DELIVERY_COLUMNS
        ))
        .bind(delivery.id)
        .bind(delivery.order_id)
        .bind(delivery.customer_id)
        .bind(delivery.courier_id)
        .bind(delivery.status)
        .bind(delivery.started_at)
        .bind(delivery.delivered_at)
        .bind(delivery.estimated_delivery_time)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        inserted.ok_or_else(|| {
            DeliveryError::Validation(format!("order {} already has a delivery", delivery.order_id))
        })
    }

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {} FROM deliveries WHERE id = $1",
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(delivery)
    }

    async fn list_deliveries(
        &self,
        filter: DeliveryFilter,
        status: Option<DeliveryStatus>,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        let (courier_id, customer_id) = match filter {
            DeliveryFilter::All => (None, None),
            DeliveryFilter::Courier(id) => (Some(id), None),
            DeliveryFilter::Customer(id) => (None, Some(id)),
        };

        let deliveries = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            SELECT {}
            FROM deliveries
            WHERE ($1::uuid IS NULL OR courier_id = $1)
              AND ($2::uuid IS NULL OR customer_id = $2)
              AND ($3::delivery_status IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(courier_id)
        .bind(customer_id)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(deliveries)
    }

    async fn apply_update(
        &self,
        delivery_id: Uuid,
        change: &DeliveryChange,
        guard: &UpdateGuard<'_>,
    ) -> Result<DeliverySnapshot> {
        let mut tx = self.pool.begin().await?;

        let mut delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {} FROM deliveries WHERE id = $1 FOR UPDATE",
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DeliveryError::NotFound(delivery_id))?;

        // Dropping the transaction on error rolls it back
        guard(&delivery)?;
        // Stamped under the lock so timestamps follow commit order
        let event = change.apply_to(&mut delivery, Utc::now());

        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            UPDATE deliveries
            SET status = $2,
                started_at = $3,
                delivered_at = $4,
                estimated_delivery_time = $5,
                updated_at = $6
            WHERE id = $1
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .bind(delivery.status)
        .bind(delivery.started_at)
        .bind(delivery.delivered_at)
        .bind(delivery.estimated_delivery_time)
        .bind(delivery.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(event) = &event {
            append_tracking_event(&mut *tx, event).await?;
        }

        let latest_event = latest_events(&mut *tx, delivery_id, 1).await?.into_iter().next();

        tx.commit().await?;

        Ok(DeliverySnapshot {
            delivery,
            latest_event,
        })
    }

    async fn set_courier(&self, delivery_id: Uuid, courier_id: Option<Uuid>) -> Result<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            UPDATE deliveries
            SET courier_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .bind(courier_id)
        .fetch_optional(&self.pool)
        .await?;

        delivery.ok_or(DeliveryError::NotFound(delivery_id))
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, display_name, role FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn tracking_history(&self, delivery_id: Uuid) -> Result<Vec<TrackingEvent>> {
        let events = sqlx::query_as::<_, TrackingEvent>(&format!(
            "SELECT {} FROM delivery_tracking_events WHERE delivery_id = $1 \
             ORDER BY created_at ASC, id ASC",
            EVENT_COLUMNS
        ))
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn latest_tracking(&self, delivery_id: Uuid, limit: i64) -> Result<Vec<TrackingEvent>> {
        let mut conn = self.pool.acquire().await?;
        latest_events(&mut *conn, delivery_id, limit).await
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_optional(&self.pool).await.is_ok()
    }
}
