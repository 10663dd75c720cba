// Storage layer for deliveries and their tracking ledger
// The store's transactions are the only concurrency control in the service.

use crate::errors::Result;
use crate::models::{Account, Delivery, DeliveryFilter, DeliverySnapshot, DeliveryStatus, TrackingEvent};
use crate::status_machine::DeliveryChange;
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgDeliveryStore;

/// Checked against the locked row before a change is written
pub type UpdateGuard<'a> = dyn Fn(&Delivery) -> Result<()> + Send + Sync + 'a;

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, delivery: &Delivery) -> Result<Delivery>;

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>>;

    async fn list_deliveries(
        &self,
        filter: DeliveryFilter,
        status: Option<DeliveryStatus>,
        limit: i64,
    ) -> Result<Vec<Delivery>>;

    /// Update the delivery row and append its tracking event atomically.
    ///
    /// Fails with `NotFound` if the row is gone and with whatever `guard`
    /// returns; nothing is written in either case.
    async fn apply_update(
        &self,
        delivery_id: Uuid,
        change: &DeliveryChange,
        guard: &UpdateGuard<'_>,
    ) -> Result<DeliverySnapshot>;

    /// Set or clear the courier reference. No ledger entry is written.
    async fn set_courier(&self, delivery_id: Uuid, courier_id: Option<Uuid>) -> Result<Delivery>;

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>>;

    /// All events for a delivery, oldest first
    async fn tracking_history(&self, delivery_id: Uuid) -> Result<Vec<TrackingEvent>>;

    /// The `limit` most recent events, newest first
    async fn latest_tracking(&self, delivery_id: Uuid, limit: i64) -> Result<Vec<TrackingEvent>>;

    /// Connectivity check for health reporting
    async fn ping(&self) -> bool;
}
