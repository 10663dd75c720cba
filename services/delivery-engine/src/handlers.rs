// HTTP surface for delivery tracking
// Every handler resolves the caller first; authorization happens in the service

use crate::access::{AccessGate, Claims, Principal, TokenVerifier};
use crate::errors::{DeliveryError, Result};
use crate::metrics::METRICS;
use crate::models::{
    AssignCourierRequest, CreateDeliveryRequest, Delivery, DeliveryDetail, DeliveryListQuery,
    DeliverySnapshot, DeliveryUpdate, TrackingEvent,
};
use crate::services::DeliveryService;
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DeliveryService>,
    pub verifier: Arc<TokenVerifier>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub store_connected: bool,
}

/// Verified bearer claims, or `None` when no Authorization header was sent.
///
/// A header that is present but invalid is rejected outright rather than
/// falling back to the public tracking link.
pub struct Caller(pub Option<Claims>);

impl Caller {
    pub fn principal(&self, delivery_id: Option<Uuid>) -> Result<Principal> {
        AccessGate::resolve(self.0.as_ref(), delivery_id)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = DeliveryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Ok(Caller(None));
        };

        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                DeliveryError::Unauthorized("Invalid Authorization header format".to_string())
            })?;

        state.verifier.verify(token).map(|claims| Caller(Some(claims)))
    }
}

/// Delivery id from the route. A malformed id is a validation error in the
/// usual JSON envelope, not axum's plain-text rejection.
pub struct DeliveryId(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for DeliveryId {
    type Rejection = DeliveryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Path(id) = Path::<Uuid>::from_request_parts(parts, state)
            .await
            .map_err(|e| DeliveryError::Validation(e.body_text()))?;
        Ok(DeliveryId(id))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/deliveries", get(list_deliveries).post(create_delivery))
        .route("/deliveries/:id", get(get_delivery).put(update_delivery))
        .route("/deliveries/:id/assign", post(assign_courier).delete(unassign_courier))
        .route("/deliveries/:id/tracking", get(tracking_history))
        .route("/deliveries/:id/stream", get(stream_delivery))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_connected = state.service.store_available().await;

    Json(HealthResponse {
        status: if store_connected { "healthy" } else { "degraded" },
        service: "delivery-engine",
        version: env!("CARGO_PKG_VERSION"),
        store_connected,
    })
}

// Prometheus metrics endpoint
async fn metrics_handler() -> Result<String> {
    METRICS
        .export()
        .map_err(|e| DeliveryError::Internal(format!("Failed to export metrics: {}", e)))
}

/// List deliveries visible to the caller
async fn list_deliveries(
    State(state): State<AppState>,
    caller: Caller,
    query: std::result::Result<Query<DeliveryListQuery>, QueryRejection>,
) -> Result<Json<Vec<Delivery>>> {
    let principal = caller.principal(None)?;
    let Query(query) = query.map_err(|e| DeliveryError::Validation(e.body_text()))?;

    let deliveries = state.service.list_deliveries(&principal, query).await?;
    Ok(Json(deliveries))
}

/// Create the delivery record for an order
async fn create_delivery(
    State(state): State<AppState>,
    caller: Caller,
    payload: std::result::Result<Json<CreateDeliveryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Delivery>)> {
    let principal = caller.principal(None)?;
    let Json(request) = payload.map_err(|e| DeliveryError::Validation(e.body_text()))?;

    let delivery = state.service.create(&principal, request).await?;
    Ok((StatusCode::CREATED, Json(delivery)))
}

async fn get_delivery(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
) -> Result<Json<DeliveryDetail>> {
    let principal = caller.principal(Some(delivery_id))?;
    let detail = state.service.get_delivery(&principal, delivery_id).await?;
    Ok(Json(detail))
}

async fn update_delivery(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
    payload: std::result::Result<Json<DeliveryUpdate>, JsonRejection>,
) -> Result<Json<DeliverySnapshot>> {
    let principal = caller.principal(Some(delivery_id))?;
    let Json(update) = payload.map_err(|e| DeliveryError::Validation(e.body_text()))?;

    let snapshot = state
        .service
        .update_delivery(&principal, delivery_id, update)
        .await?;
    Ok(Json(snapshot))
}

async fn assign_courier(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
    payload: std::result::Result<Json<AssignCourierRequest>, JsonRejection>,
) -> Result<Json<Delivery>> {
    let principal = caller.principal(Some(delivery_id))?;
    let Json(request) = payload.map_err(|e| DeliveryError::Validation(e.body_text()))?;

    let delivery = state
        .service
        .assign_courier(&principal, delivery_id, request.courier_id)
        .await?;
    Ok(Json(delivery))
}

async fn unassign_courier(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
) -> Result<Json<Delivery>> {
    let principal = caller.principal(Some(delivery_id))?;
    let delivery = state.service.unassign_courier(&principal, delivery_id).await?;
    Ok(Json(delivery))
}

async fn tracking_history(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
) -> Result<Json<Vec<TrackingEvent>>> {
    let principal = caller.principal(Some(delivery_id))?;
    let events = state.service.tracking_history(&principal, delivery_id).await?;
    Ok(Json(events))
}

/// Server-sent live feed: a `snapshot` event per tick, `error` then close on failure
async fn stream_delivery(
    State(state): State<AppState>,
    DeliveryId(delivery_id): DeliveryId,
    caller: Caller,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let principal = caller.principal(Some(delivery_id))?;
    let feed = state.service.open_stream(&principal, delivery_id).await?;

    let events = feed.map(|item| {
        let event = match item {
            Ok(snapshot) => Event::default()
                .event("snapshot")
                .json_data(&snapshot)
                .unwrap_or_else(|e| error_event("internal_error", &e.to_string())),
            Err(err) if err.is_internal() => error_event(err.error_type(), "Live feed fetch failed"),
            Err(err) => error_event(err.error_type(), &err.to_string()),
        };
        Ok(event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn error_event(error_type: &str, message: &str) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "type": error_type, "message": message }).to_string())
}
