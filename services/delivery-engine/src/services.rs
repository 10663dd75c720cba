use crate::access::{AccessGate, Operation, Principal};
use crate::assignment::AssignmentRegistry;
use crate::config::Config;
use crate::errors::{DeliveryError, Result};
use crate::feed::{FeedSubscription, LiveFeedBridge};
use crate::ledger::TrackingLedger;
use crate::models::{
    CreateDeliveryRequest, Delivery, DeliveryDetail, DeliveryListQuery, DeliverySnapshot,
    DeliveryUpdate, PartySummary, TrackingEvent,
};
use crate::status_machine::StatusMachine;
use crate::store::DeliveryStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const LIST_LIMIT: i64 = 200;

/// Tunables the service needs out of [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub max_recent_events: usize,
    pub max_notes_len: usize,
    pub tick_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_recent_events: 50,
            max_notes_len: 1000,
            tick_interval: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_recent_events: config.tracking.max_recent_events,
            max_notes_len: config.tracking.max_notes_len,
            tick_interval: config.stream.tick_interval(),
        }
    }
}

pub struct DeliveryService {
    store: Arc<dyn DeliveryStore>,
    status_machine: StatusMachine,
    assignments: AssignmentRegistry,
    ledger: TrackingLedger,
    feed: LiveFeedBridge,
    max_recent_events: usize,
}

impl DeliveryService {
    pub fn new(store: Arc<dyn DeliveryStore>, settings: ServiceSettings) -> Self {
        let ledger = TrackingLedger::new(store.clone(), settings.max_recent_events);

        Self {
            status_machine: StatusMachine::new(store.clone(), settings.max_notes_len),
            assignments: AssignmentRegistry::new(store.clone()),
            feed: LiveFeedBridge::new(ledger.clone(), settings.tick_interval),
            ledger,
            store,
            max_recent_events: settings.max_recent_events,
        }
    }

    /// Create the pending delivery record for a freshly placed order.
    ///
    /// Called by the ordering boundary, which has already authorized the order.
    pub async fn create_for_order(&self, request: CreateDeliveryRequest) -> Result<Delivery> {
        let mut delivery = Delivery::new(request.order_id, request.customer_id);
        delivery.estimated_delivery_time = request.estimated_delivery_time;

        let created = self.store.insert_delivery(&delivery).await?;

        info!(
            delivery_id = %created.id,
            order_id = %created.order_id,
            "Delivery created"
        );

        Ok(created)
    }

    /// Staff-initiated creation through the HTTP surface
    pub async fn create(&self, principal: &Principal, request: CreateDeliveryRequest) -> Result<Delivery> {
        AccessGate::require_staff(principal)?;
        self.create_for_order(request).await
    }

    /// Delivery detail with party summaries and the most recent events
    pub async fn get_delivery(&self, principal: &Principal, delivery_id: Uuid) -> Result<DeliveryDetail> {
        let delivery = self.load(delivery_id).await?;
        AccessGate::authorize(principal, Operation::Read, &delivery)?;

        let customer = self
            .store
            .find_account(delivery.customer_id)
            .await?
            .map(|account| PartySummary::from(&account));

        let courier = match delivery.courier_id {
            Some(courier_id) => self
                .store
                .find_account(courier_id)
                .await?
                .map(|account| PartySummary::from(&account)),
            None => None,
        };

        let tracking_events = self.ledger.latest(delivery_id, self.max_recent_events).await?;

        Ok(DeliveryDetail {
            delivery,
            customer,
            courier,
            tracking_events,
        })
    }

    /// Deliveries visible to the caller, newest first
    pub async fn list_deliveries(&self, principal: &Principal, query: DeliveryListQuery) -> Result<Vec<Delivery>> {
        let filter = AccessGate::list_filter(principal)?;
        self.store.list_deliveries(filter, query.status, LIST_LIMIT).await
    }

    pub async fn update_delivery(
        &self,
        principal: &Principal,
        delivery_id: Uuid,
        update: DeliveryUpdate,
    ) -> Result<DeliverySnapshot> {
        self.status_machine.update_delivery(principal, delivery_id, update).await
    }

    pub async fn assign_courier(&self, principal: &Principal, delivery_id: Uuid, courier_id: Uuid) -> Result<Delivery> {
        self.assignments.assign(principal, delivery_id, courier_id).await
    }

    pub async fn unassign_courier(&self, principal: &Principal, delivery_id: Uuid) -> Result<Delivery> {
        self.assignments.unassign(principal, delivery_id).await
    }

    /// Full tracking history, oldest first
    pub async fn tracking_history(&self, principal: &Principal, delivery_id: Uuid) -> Result<Vec<TrackingEvent>> {
        let delivery = self.load(delivery_id).await?;
        AccessGate::authorize(principal, Operation::History, &delivery)?;

        self.ledger.history(delivery_id).await
    }

    pub async fn open_stream(&self, principal: &Principal, delivery_id: Uuid) -> Result<FeedSubscription> {
        self.feed.subscribe(principal, delivery_id).await
    }

    /// Ends all live feeds so a graceful shutdown is not held open by them
    pub fn shutdown_feeds(&self) {
        self.feed.shutdown();
    }

    pub async fn store_available(&self) -> bool {
        self.store.ping().await
    }

    async fn load(&self, delivery_id: Uuid) -> Result<Delivery> {
        self.store
            .get_delivery(delivery_id)
            .await?
            .ok_or(DeliveryError::NotFound(delivery_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountRole, DeliveryStatus};
    use crate::store::InMemoryStore;

    async fn service() -> (Arc<InMemoryStore>, DeliveryService) {
        let store = Arc::new(InMemoryStore::new());
        let service = DeliveryService::new(store.clone(), ServiceSettings::default());
        (store, service)
    }

    fn create_request(customer_id: Uuid) -> CreateDeliveryRequest {
        CreateDeliveryRequest {
            order_id: Uuid::new_v4(),
            customer_id,
            estimated_delivery_time: None,
        }
    }

    #[tokio::test]
    async fn test_detail_includes_parties_and_recent_events() {
        let (store, service) = service().await;
        let customer = Account {
            id: Uuid::new_v4(),
            display_name: "Ada Customer".to_string(),
            role: AccountRole::Customer,
        };
        let courier = Account {
            id: Uuid::new_v4(),
            display_name: "Bo Courier".to_string(),
            role: AccountRole::Courier,
        };
        store.add_account(customer.clone()).await;
        store.add_account(courier.clone()).await;

        let staff = Principal::Staff { id: Uuid::new_v4() };
        let delivery = service.create_for_order(create_request(customer.id)).await.unwrap();
        service.assign_courier(&staff, delivery.id, courier.id).await.unwrap();
        service
            .update_delivery(
                &staff,
                delivery.id,
                DeliveryUpdate {
                    status: Some(DeliveryStatus::Preparing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let detail = service.get_delivery(&staff, delivery.id).await.unwrap();
        assert_eq!(detail.customer.unwrap().display_name, "Ada Customer");
        assert_eq!(detail.courier.unwrap().id, courier.id);
        assert_eq!(detail.tracking_events.len(), 1);
        assert_eq!(detail.tracking_events[0].status, DeliveryStatus::Preparing);
    }

    #[tokio::test]
    async fn test_one_delivery_per_order() {
        let (_store, service) = service().await;
        let request = create_request(Uuid::new_v4());

        service.create_for_order(request.clone()).await.unwrap();
        let duplicate = service.create_for_order(request).await;
        assert!(matches!(duplicate, Err(DeliveryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_only_staff_create_through_http_surface() {
        let (_store, service) = service().await;
        let customer_id = Uuid::new_v4();

        let as_customer = Principal::Customer { id: customer_id };
        let result = service.create(&as_customer, create_request(customer_id)).await;
        assert!(matches!(result, Err(DeliveryError::Forbidden(_))));

        let staff = Principal::Staff { id: Uuid::new_v4() };
        let created = service.create(&staff, create_request(customer_id)).await.unwrap();
        assert_eq!(created.status, DeliveryStatus::Pending);
        assert!(created.courier_id.is_none());
    }

    #[tokio::test]
    async fn test_history_requires_staff_or_owner() {
        let (_store, service) = service().await;
        let customer_id = Uuid::new_v4();
        let delivery = service.create_for_order(create_request(customer_id)).await.unwrap();

        let owner = Principal::Customer { id: customer_id };
        assert!(service.tracking_history(&owner, delivery.id).await.unwrap().is_empty());

        let holder = Principal::PublicLink { delivery_id: delivery.id };
        assert!(matches!(
            service.tracking_history(&holder, delivery.id).await,
            Err(DeliveryError::Forbidden(_))
        ));

        let courier = Principal::Courier { id: Uuid::new_v4() };
        assert!(matches!(
            service.tracking_history(&courier, delivery.id).await,
            Err(DeliveryError::Forbidden(_))
        ));
    }
}
