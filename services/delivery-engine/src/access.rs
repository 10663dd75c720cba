// Access gate for delivery operations
// Resolves the caller into a principal and checks it against the delivery

use crate::errors::{DeliveryError, Result};
use crate::metrics::METRICS;
use crate::models::{AccountRole, Delivery, DeliveryFilter};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Bearer token claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: AccountRole,
    pub exp: usize,
}

/// Verifies HS256 bearer tokens. Issuing them is not our job.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                warn!("JWT validation failed: {:?}", err);
                DeliveryError::Unauthorized("Invalid or expired token".to_string())
            })
    }
}

/// The calling party, resolved once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Staff { id: Uuid },
    Courier { id: Uuid },
    Customer { id: Uuid },
    /// Anyone presenting a delivery id. The id is the whole capability:
    /// read-only, no further authentication.
    PublicLink { delivery_id: Uuid },
}

impl Principal {
    pub fn kind(&self) -> &'static str {
        match self {
            Principal::Staff { .. } => "staff",
            Principal::Courier { .. } => "courier",
            Principal::Customer { .. } => "customer",
            Principal::PublicLink { .. } => "public_link",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Update,
    Assign,
    History,
    Stream,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Assign => "assign",
            Operation::History => "history",
            Operation::Stream => "stream",
        }
    }
}

pub struct AccessGate;

impl AccessGate {
    /// Resolve a principal from verified claims.
    ///
    /// Without claims the caller is a public-link holder of `delivery_id`;
    /// routes that carry no delivery id have nothing to grant anonymously.
    pub fn resolve(claims: Option<&Claims>, delivery_id: Option<Uuid>) -> Result<Principal> {
        match (claims, delivery_id) {
            (Some(claims), _) => Ok(match claims.role {
                role if role.is_staff() => Principal::Staff { id: claims.sub },
                AccountRole::Courier => Principal::Courier { id: claims.sub },
                _ => Principal::Customer { id: claims.sub },
            }),
            (None, Some(delivery_id)) => Ok(Principal::PublicLink { delivery_id }),
            (None, None) => Err(DeliveryError::Unauthorized(
                "Missing Authorization header".to_string(),
            )),
        }
    }

    pub fn is_allowed(principal: &Principal, operation: Operation, delivery: &Delivery) -> bool {
        match (principal, operation) {
            (Principal::Staff { .. }, _) => true,

            (Principal::Courier { id }, Operation::Read | Operation::Update) => {
                delivery.is_assigned_to(*id)
            }
            (Principal::Courier { .. }, _) => false,

            (Principal::Customer { id }, Operation::Read | Operation::History | Operation::Stream) => {
                delivery.customer_id == *id
            }
            (Principal::Customer { .. }, _) => false,

            (Principal::PublicLink { delivery_id }, Operation::Read) => *delivery_id == delivery.id,
            (Principal::PublicLink { .. }, _) => false,
        }
    }

    pub fn authorize(principal: &Principal, operation: Operation, delivery: &Delivery) -> Result<()> {
        if Self::is_allowed(principal, operation, delivery) {
            return Ok(());
        }

        METRICS.access_denied_total.inc();
        warn!(
            principal = principal.kind(),
            operation = operation.as_str(),
            delivery_id = %delivery.id,
            "Access denied"
        );

        Err(DeliveryError::Forbidden(format!(
            "{} may not {} delivery {}",
            principal.kind(),
            operation.as_str(),
            delivery.id
        )))
    }

    /// Role-only check for operations that do not depend on the delivery
    pub fn require_staff(principal: &Principal) -> Result<()> {
        match principal {
            Principal::Staff { .. } => Ok(()),
            other => {
                METRICS.access_denied_total.inc();
                warn!(principal = other.kind(), "Staff-only operation denied");
                Err(DeliveryError::Forbidden(
                    "Operation requires staff privileges".to_string(),
                ))
            }
        }
    }

    /// Which deliveries a principal may list
    pub fn list_filter(principal: &Principal) -> Result<DeliveryFilter> {
        match principal {
            Principal::Staff { .. } => Ok(DeliveryFilter::All),
            Principal::Courier { id } => Ok(DeliveryFilter::Courier(*id)),
            Principal::Customer { id } => Ok(DeliveryFilter::Customer(*id)),
            Principal::PublicLink { .. } => Err(DeliveryError::Unauthorized(
                "Listing deliveries requires authentication".to_string(),
            )),
        }
    }
}
