//! Read models over the delivery tracking ledger.
//!
//! The ledger only grows: entries are appended by the store inside the
//! same transaction that updates the delivery row, and never touched again.

use crate::errors::{DeliveryError, Result};
use crate::models::{DeliverySnapshot, TrackingEvent};
use crate::store::DeliveryStore;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct TrackingLedger {
    store: Arc<dyn DeliveryStore>,
    max_recent_events: usize,
}

impl TrackingLedger {
    pub fn new(store: Arc<dyn DeliveryStore>, max_recent_events: usize) -> Self {
        Self {
            store,
            max_recent_events: max_recent_events.max(1),
        }
    }

    /// Full history, oldest first
    pub async fn history(&self, delivery_id: Uuid) -> Result<Vec<TrackingEvent>> {
        self.store.tracking_history(delivery_id).await
    }

    /// The `n` most recent events, newest first. `n` is clamped to
    /// `1..=max_recent_events`.
    pub async fn latest(&self, delivery_id: Uuid, n: usize) -> Result<Vec<TrackingEvent>> {
        let limit = n.clamp(1, self.max_recent_events);
        self.store.latest_tracking(delivery_id, limit as i64).await
    }

    /// Current delivery record plus its most recent event
    pub async fn snapshot(&self, delivery_id: Uuid) -> Result<DeliverySnapshot> {
        let delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(DeliveryError::NotFound(delivery_id))?;
        let latest_event = self.latest(delivery_id, 1).await?.into_iter().next();

        Ok(DeliverySnapshot {
            delivery,
            latest_event,
        })
    }
}
