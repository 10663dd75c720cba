// In-memory delivery store for tests and local runs.
// One write lock spans read-modify-append, standing in for a transaction.

use super::{DeliveryStore, UpdateGuard};
use crate::errors::{DeliveryError, Result};
use crate::models::{Account, Delivery, DeliveryFilter, DeliverySnapshot, DeliveryStatus, TrackingEvent};
use crate::status_machine::DeliveryChange;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    deliveries: HashMap<Uuid, Delivery>,
    events: HashMap<Uuid, Vec<TrackingEvent>>,
    accounts: HashMap<Uuid, Account>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    reads: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the identity directory
    pub async fn add_account(&self, account: Account) {
        self.state.write().await.accounts.insert(account.id, account);
    }

    /// Number of read calls served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Simulate a backing store outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeliveryError::Internal("store unavailable".to_string()));
        }
        Ok(())
    }

    fn begin_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn insert_delivery(&self, delivery: &Delivery) -> Result<Delivery> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.deliveries.values().any(|d| d.order_id == delivery.order_id) {
            return Err(DeliveryError::Validation(format!(
                "order {} already has a delivery",
                delivery.order_id
            )));
        }
        state.deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery.clone())
    }

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>> {
        self.begin_read()?;
        Ok(self.state.read().await.deliveries.get(&delivery_id).cloned())
    }

    async fn list_deliveries(
        &self,
        filter: DeliveryFilter,
        status: Option<DeliveryStatus>,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        self.begin_read()?;
        let state = self.state.read().await;

        let mut deliveries: Vec<Delivery> = state
            .deliveries
            .values()
            .filter(|d| match filter {
                DeliveryFilter::All => true,
                DeliveryFilter::Courier(id) => d.courier_id == Some(id),
                DeliveryFilter::Customer(id) => d.customer_id == id,
            })
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();

        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deliveries.truncate(limit.max(0) as usize);
        Ok(deliveries)
    }

    async fn apply_update(
        &self,
        delivery_id: Uuid,
        change: &DeliveryChange,
        guard: &UpdateGuard<'_>,
    ) -> Result<DeliverySnapshot> {
        self.check_available()?;
        let mut state = self.state.write().await;

        let mut delivery = state
            .deliveries
            .get(&delivery_id)
            .cloned()
            .ok_or(DeliveryError::NotFound(delivery_id))?;
        guard(&delivery)?;

        // Stamped under the lock so timestamps follow commit order
        let event = change.apply_to(&mut delivery, Utc::now());
        state.deliveries.insert(delivery_id, delivery.clone());

        let ledger = state.events.entry(delivery_id).or_default();
        if let Some(event) = event {
            ledger.push(event);
        }
        let latest_event = ledger.last().cloned();

        Ok(DeliverySnapshot {
            delivery,
            latest_event,
        })
    }

    async fn set_courier(&self, delivery_id: Uuid, courier_id: Option<Uuid>) -> Result<Delivery> {
        self.check_available()?;
        let mut state = self.state.write().await;

        let delivery = state
            .deliveries
            .get_mut(&delivery_id)
            .ok_or(DeliveryError::NotFound(delivery_id))?;
        delivery.courier_id = courier_id;
        delivery.updated_at = Utc::now();
        Ok(delivery.clone())
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        self.begin_read()?;
        Ok(self.state.read().await.accounts.get(&account_id).cloned())
    }

    async fn tracking_history(&self, delivery_id: Uuid) -> Result<Vec<TrackingEvent>> {
        self.begin_read()?;
        Ok(self
            .state
            .read()
            .await
            .events
            .get(&delivery_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_tracking(&self, delivery_id: Uuid, limit: i64) -> Result<Vec<TrackingEvent>> {
        self.begin_read()?;
        let state = self.state.read().await;
        Ok(state
            .events
            .get(&delivery_id)
            .map(|events| {
                events
                    .iter()
                    .rev()
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}
