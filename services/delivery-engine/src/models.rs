use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Delivery lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Preparing,
    OutForDelivery,
    InTransit,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Preparing,
        DeliveryStatus::OutForDelivery,
        DeliveryStatus::InTransit,
        DeliveryStatus::Delivered,
        DeliveryStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Preparing => "preparing",
            DeliveryStatus::OutForDelivery => "out_for_delivery",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    /// No further transition is meaningful for the product once here
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown delivery status '{}'", s))
    }
}

/// Current state of one order's delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub status: DeliveryStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(order_id: Uuid, customer_id: Uuid) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            order_id,
            customer_id,
            courier_id: None,
            status: DeliveryStatus::Pending,
            started_at: None,
            delivered_at: None,
            estimated_delivery_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_assigned_to(&self, courier_id: Uuid) -> bool {
        self.courier_id == Some(courier_id)
    }
}

/// One immutable breadcrumb in a delivery's tracking ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub status: DeliveryStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Role held by an account in the identity directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Admin,
    Manager,
    Staff,
    #[serde(alias = "delivery")]
    Courier,
    Customer,
}

impl AccountRole {
    pub fn is_staff(&self) -> bool {
        matches!(
            self,
            AccountRole::Admin | AccountRole::Manager | AccountRole::Staff
        )
    }

    /// Staff members may run deliveries themselves
    pub fn can_deliver(&self) -> bool {
        self.is_staff() || *self == AccountRole::Courier
    }
}

impl FromStr for AccountRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(AccountRole::Admin),
            "manager" => Ok(AccountRole::Manager),
            "staff" => Ok(AccountRole::Staff),
            "courier" | "delivery" => Ok(AccountRole::Courier),
            "customer" => Ok(AccountRole::Customer),
            other => Err(format!("unknown account role '{}'", other)),
        }
    }
}

/// Directory entry for a customer, employee or courier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub display_name: String,
    pub role: AccountRole,
}

/// Party summary embedded in delivery detail views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartySummary {
    pub id: Uuid,
    pub display_name: String,
}

impl From<&Account> for PartySummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            display_name: account.display_name.clone(),
        }
    }
}

/// Delivery record plus its most recent tracking event.
///
/// Used both as the result of an update and as one live feed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshot {
    pub delivery: Delivery,
    pub latest_event: Option<TrackingEvent>,
}

/// Detail view returned by `GET /deliveries/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryDetail {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub customer: Option<PartySummary>,
    pub courier: Option<PartySummary>,
    pub tracking_events: Vec<TrackingEvent>,
}

/// Partial update sent by staff or the assigned courier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub status: Option<DeliveryStatus>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl DeliveryUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
            && self.estimated_delivery_time.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignCourierRequest {
    pub courier_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeliveryRequest {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryListQuery {
    pub status: Option<DeliveryStatus>,
}

/// Narrows a delivery listing to what a principal may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFilter {
    All,
    Courier(Uuid),
    Customer(Uuid),
}
