use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Delivery not found: {0}")]
    NotFound(Uuid),

    #[error("Courier not found: {0}")]
    CourierNotFound(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl DeliveryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeliveryError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::CourierNotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::Validation(_) => StatusCode::BAD_REQUEST,
            DeliveryError::Forbidden(_) => StatusCode::FORBIDDEN,
            DeliveryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DeliveryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            DeliveryError::Database(_) => "database_error",
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::CourierNotFound(_) => "not_found",
            DeliveryError::Validation(_) => "validation_error",
            DeliveryError::Forbidden(_) => "forbidden",
            DeliveryError::Unauthorized(_) => "unauthorized",
            DeliveryError::Internal(_) => "internal_error",
        }
    }

    /// Store and internal failures; these end a live feed.
    pub fn is_internal(&self) -> bool {
        matches!(self, DeliveryError::Database(_) | DeliveryError::Internal(_))
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Store details stay in the logs
        let message = match &self {
            DeliveryError::Database(e) => {
                tracing::error!("Database failure: {}", e);
                "Database error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": status.as_u16(),
                    "type": self.error_type(),
                    "message": message,
                },
                "timestamp": Utc::now(),
            })),
        )
            .into_response()
    }
}
