// Status machine for delivery updates
// Validates partial updates and derives lifecycle timestamps. The store
// applies the resulting change and its ledger entry in one transaction.

use crate::access::{AccessGate, Operation, Principal};
use crate::errors::{DeliveryError, Result};
use crate::metrics::METRICS;
use crate::models::{Delivery, DeliverySnapshot, DeliveryStatus, DeliveryUpdate, GeoPoint, TrackingEvent};
use crate::store::DeliveryStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A validated update, ready to be applied under the row lock
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryChange {
    pub status: Option<DeliveryStatus>,
    pub position: Option<GeoPoint>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl DeliveryChange {
    pub fn from_update(update: DeliveryUpdate, max_notes_len: usize) -> Result<Self> {
        let position = match (update.latitude, update.longitude) {
            (None, None) => None,
            (Some(latitude), Some(longitude)) => Some(validate_position(latitude, longitude)?),
            _ => {
                return Err(DeliveryError::Validation(
                    "latitude and longitude must be supplied together".to_string(),
                ))
            }
        };

        let notes = match update.notes.as_deref().map(str::trim) {
            Some(notes) if notes.chars().count() > max_notes_len => {
                return Err(DeliveryError::Validation(format!(
                    "notes must be at most {} characters",
                    max_notes_len
                )))
            }
            Some("") | None => None,
            Some(notes) => Some(notes.to_string()),
        };

        let change = Self {
            status: update.status,
            position,
            estimated_delivery_time: update.estimated_delivery_time,
            notes,
        };

        if change.status.is_none()
            && change.position.is_none()
            && change.estimated_delivery_time.is_none()
            && change.notes.is_none()
        {
            return Err(DeliveryError::Validation(
                "at least one of status, latitude/longitude, estimatedDeliveryTime or notes is required"
                    .to_string(),
            ));
        }

        Ok(change)
    }

    /// Whether this change leaves a breadcrumb in the ledger. Notes only
    /// travel on an event carrying a status or a position.
    pub fn records_event(&self) -> bool {
        self.status.is_some() || self.position.is_some()
    }

    /// Apply to the current row and return the ledger entry to append.
    ///
    /// `at` must be read while the row is locked so commit order and
    /// timestamp order agree. Any status may follow any other; only enum
    /// membership is enforced.
    pub fn apply_to(&self, delivery: &mut Delivery, at: DateTime<Utc>) -> Option<TrackingEvent> {
        if let Some(status) = self.status {
            if status == DeliveryStatus::OutForDelivery && delivery.started_at.is_none() {
                delivery.started_at = Some(at);
            }

            // delivered_at is set iff the status is delivered
            if status == DeliveryStatus::Delivered {
                if delivery.delivered_at.is_none() {
                    delivery.delivered_at = Some(at);
                }
            } else {
                delivery.delivered_at = None;
            }

            delivery.status = status;
        }

        if let Some(eta) = self.estimated_delivery_time {
            delivery.estimated_delivery_time = Some(eta);
        }

        delivery.updated_at = at;

        if !self.records_event() {
            return None;
        }

        Some(TrackingEvent {
            id: Uuid::now_v7(),
            delivery_id: delivery.id,
            status: delivery.status,
            latitude: self.position.map(|p| p.latitude),
            longitude: self.position.map(|p| p.longitude),
            notes: self.notes.clone(),
            created_at: at,
        })
    }
}

fn validate_position(latitude: f64, longitude: f64) -> Result<GeoPoint> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(DeliveryError::Validation(format!(
            "latitude must be within [-90, 90], got {}",
            latitude
        )));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(DeliveryError::Validation(format!(
            "longitude must be within [-180, 180], got {}",
            longitude
        )));
    }
    Ok(GeoPoint { latitude, longitude })
}

pub struct StatusMachine {
    store: Arc<dyn DeliveryStore>,
    max_notes_len: usize,
}

impl StatusMachine {
    pub fn new(store: Arc<dyn DeliveryStore>, max_notes_len: usize) -> Self {
        Self { store, max_notes_len }
    }

    /// Apply a partial update on behalf of staff or the assigned courier
    pub async fn update_delivery(
        &self,
        principal: &Principal,
        delivery_id: Uuid,
        update: DeliveryUpdate,
    ) -> Result<DeliverySnapshot> {
        if update.is_empty() {
            return Err(DeliveryError::Validation(
                "update must contain at least one field".to_string(),
            ));
        }

        let delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(DeliveryError::NotFound(delivery_id))?;
        AccessGate::authorize(principal, Operation::Update, &delivery)?;

        if delivery.status.is_terminal() {
            warn!(
                delivery_id = %delivery_id,
                status = %delivery.status,
                "Updating a delivery that already reached a terminal status"
            );
        }

        let change = DeliveryChange::from_update(update, self.max_notes_len)?;

        // Re-checked under the row lock, the courier may have been reassigned
        let guard = |current: &Delivery| AccessGate::authorize(principal, Operation::Update, current);
        let snapshot = self.store.apply_update(delivery_id, &change, &guard).await?;

        METRICS.delivery_updates_total.inc();
        if change.records_event() {
            METRICS.tracking_events_total.inc();
        }

        info!(
            delivery_id = %delivery_id,
            principal = principal.kind(),
            status = %snapshot.delivery.status,
            "Delivery updated"
        );

        Ok(snapshot)
    }
}
