// Courier assignment registry
// Staff-only mutation of a delivery's courier reference. Assignment is
// orthogonal to the tracking ledger and never writes an event.

use crate::access::{AccessGate, Principal};
use crate::errors::{DeliveryError, Result};
use crate::metrics::METRICS;
use crate::models::Delivery;
use crate::store::DeliveryStore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct AssignmentRegistry {
    store: Arc<dyn DeliveryStore>,
}

impl AssignmentRegistry {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    /// Assign (or reassign) a courier to a delivery
    pub async fn assign(&self, principal: &Principal, delivery_id: Uuid, courier_id: Uuid) -> Result<Delivery> {
        AccessGate::require_staff(principal)?;

        let delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(DeliveryError::NotFound(delivery_id))?;

        let courier = self
            .store
            .find_account(courier_id)
            .await?
            .ok_or(DeliveryError::CourierNotFound(courier_id))?;

        if !courier.role.can_deliver() {
            return Err(DeliveryError::Validation(format!(
                "account {} cannot be assigned deliveries",
                courier_id
            )));
        }

        let updated = self.store.set_courier(delivery_id, Some(courier_id)).await?;

        METRICS.assignments_total.inc();
        info!(
            delivery_id = %delivery_id,
            courier_id = %courier_id,
            previous_courier = ?delivery.courier_id,
            "Courier assigned"
        );

        Ok(updated)
    }

    /// Clear the courier reference; a no-op when already unassigned
    pub async fn unassign(&self, principal: &Principal, delivery_id: Uuid) -> Result<Delivery> {
        AccessGate::require_staff(principal)?;

        let updated = self.store.set_courier(delivery_id, None).await?;

        METRICS.assignments_total.inc();
        info!(delivery_id = %delivery_id, "Courier unassigned");

        Ok(updated)
    }
}
