// HTTP tests for the delivery routes, driven through the router with oneshot

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use delivery_engine::access::{Claims, Principal, TokenVerifier};
use delivery_engine::models::{Account, AccountRole, CreateDeliveryRequest, Delivery};
use delivery_engine::store::InMemoryStore;
use delivery_engine::{router, AppState, DeliveryService, ServiceSettings};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-signing-secret";

struct TestApp {
    app: Router,
    store: Arc<InMemoryStore>,
    service: Arc<DeliveryService>,
    delivery: Delivery,
    customer_id: Uuid,
}

async fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(DeliveryService::new(store.clone(), ServiceSettings::default()));

    let customer_id = Uuid::new_v4();
    store
        .add_account(Account {
            id: customer_id,
            display_name: "Grace Customer".to_string(),
            role: AccountRole::Customer,
        })
        .await;

    let delivery = service
        .create_for_order(CreateDeliveryRequest {
            order_id: Uuid::new_v4(),
            customer_id,
            estimated_delivery_time: None,
        })
        .await
        .unwrap();

    let app = router(AppState {
        service: service.clone(),
        verifier: Arc::new(TokenVerifier::new(SECRET)),
    });

    TestApp {
        app,
        store,
        service,
        delivery,
        customer_id,
    }
}

fn token(sub: Uuid, role: AccountRole) -> String {
    let claims = Claims {
        sub,
        role,
        exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> = value.as_object().unwrap().keys().cloned().collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_public_link_reads_same_shape_but_cannot_write() {
    let t = test_app().await;
    let uri = format!("/deliveries/{}", t.delivery.id);
    let staff = token(Uuid::new_v4(), AccountRole::Manager);

    let (status, staff_view) = send(&t.app, request(Method::GET, &uri, Some(&staff), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, public_view) = send(&t.app, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(keys(&public_view), keys(&staff_view));
    assert_eq!(public_view["customer"]["displayName"], "Grace Customer");
    assert_eq!(public_view["status"], "pending");

    let (status, body) = send(
        &t.app,
        request(Method::PUT, &uri, None, Some(json!({ "status": "delivered" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "forbidden");
    let staff = Principal::Staff { id: Uuid::new_v4() };
    let history = t.service.tracking_history(&staff, t.delivery.id).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_invalid_token_is_not_downgraded_to_public() {
    let t = test_app().await;
    let uri = format!("/deliveries/{}", t.delivery.id);

    let (status, body) = send(&t.app, request(Method::GET, &uri, Some("not-a-jwt"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], 401);

    let forged = {
        let claims = Claims {
            sub: Uuid::new_v4(),
            role: AccountRole::Admin,
            exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"other-secret")).unwrap()
    };
    let (status, _) = send(&t.app, request(Method::GET, &uri, Some(&forged), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_update_validation_errors() {
    let t = test_app().await;
    let uri = format!("/deliveries/{}", t.delivery.id);
    let staff = token(Uuid::new_v4(), AccountRole::Staff);

    for body in [
        json!({ "status": "shipped" }),
        json!({}),
        json!({ "latitude": 91.0, "longitude": 0.0 }),
        json!({ "latitude": 0.0, "longitude": 200.0 }),
        json!({ "latitude": 10.0 }),
    ] {
        let (status, response) =
            send(&t.app, request(Method::PUT, &uri, Some(&staff), Some(body.clone()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(response["error"]["type"], "validation_error");
    }

    let (status, history) = send(
        &t.app,
        request(Method::GET, &format!("{}/tracking", uri), Some(&staff), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_unknown_delivery_is_not_found() {
    let t = test_app().await;
    let staff = token(Uuid::new_v4(), AccountRole::Admin);
    let uri = format!("/deliveries/{}", Uuid::new_v4());

    let (status, body) = send(&t.app, request(Method::GET, &uri, Some(&staff), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");

    let (status, _) = send(
        &t.app,
        request(Method::PUT, &uri, Some(&staff), Some(json!({ "status": "preparing" }))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_delivery_id_is_validation_error() {
    let t = test_app().await;
    let staff = token(Uuid::new_v4(), AccountRole::Admin);

    for uri in ["/deliveries/not-a-uuid", "/deliveries/12345/tracking"] {
        let (status, body) = send(&t.app, request(Method::GET, uri, Some(&staff), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["error"]["type"], "validation_error");
    }
}

#[tokio::test]
async fn test_assignment_flow_over_http() {
    let t = test_app().await;
    let courier_id = Uuid::new_v4();
    t.store
        .add_account(Account {
            id: courier_id,
            display_name: "Rider Two".to_string(),
            role: AccountRole::Courier,
        })
        .await;

    let base = format!("/deliveries/{}", t.delivery.id);
    let assign_uri = format!("{}/assign", base);
    let staff = token(Uuid::new_v4(), AccountRole::Staff);
    let courier = token(courier_id, AccountRole::Courier);

    // Not yet assigned
    let (status, _) = send(
        &t.app,
        request(Method::PUT, &base, Some(&courier), Some(json!({ "status": "out_for_delivery" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Couriers cannot assign themselves
    let (status, _) = send(
        &t.app,
        request(Method::POST, &assign_uri, Some(&courier), Some(json!({ "courierId": courier_id }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &t.app,
        request(Method::POST, &assign_uri, Some(&staff), Some(json!({ "courierId": courier_id }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["courierId"], courier_id.to_string());

    let (status, body) = send(
        &t.app,
        request(
            Method::PUT,
            &base,
            Some(&courier),
            Some(json!({ "status": "out_for_delivery", "latitude": 48.85, "longitude": 2.35 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["status"], "out_for_delivery");
    assert!(body["delivery"]["startedAt"].is_string());
    assert_eq!(body["latestEvent"]["latitude"], 48.85);

    let (status, body) = send(
        &t.app,
        request(
            Method::POST,
            &assign_uri,
            Some(&staff),
            Some(json!({ "courierId": Uuid::new_v4() })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");

    let (status, body) = send(&t.app, request(Method::DELETE, &assign_uri, Some(&staff), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["courierId"].is_null());
}

#[tokio::test]
async fn test_tracking_history_access() {
    let t = test_app().await;
    let uri = format!("/deliveries/{}/tracking", t.delivery.id);

    let owner = token(t.customer_id, AccountRole::Customer);
    let (status, _) = send(&t.app, request(Method::GET, &uri, Some(&owner), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&t.app, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let stranger = token(Uuid::new_v4(), AccountRole::Customer);
    let (status, _) = send(&t.app, request(Method::GET, &uri, Some(&stranger), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_list_and_create() {
    let t = test_app().await;
    let staff = token(Uuid::new_v4(), AccountRole::Admin);
    let customer = token(t.customer_id, AccountRole::Customer);

    let (status, _) = send(&t.app, request(Method::GET, "/deliveries", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &t.app,
        request(
            Method::POST,
            "/deliveries",
            Some(&customer),
            Some(json!({ "orderId": Uuid::new_v4(), "customerId": t.customer_id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = send(
        &t.app,
        request(
            Method::POST,
            "/deliveries",
            Some(&staff),
            Some(json!({ "orderId": Uuid::new_v4(), "customerId": Uuid::new_v4() })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");

    let (status, all) = send(&t.app, request(Method::GET, "/deliveries", Some(&staff), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (status, own) = send(&t.app, request(Method::GET, "/deliveries", Some(&customer), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(own.as_array().unwrap().len(), 1);

    let (status, pending) = send(
        &t.app,
        request(Method::GET, "/deliveries?status=pending", Some(&staff), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 2);

    let (status, _) = send(
        &t.app,
        request(Method::GET, "/deliveries?status=lost", Some(&staff), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_sends_snapshot_first() {
    let t = test_app().await;
    let uri = format!("/deliveries/{}/stream", t.delivery.id);

    let (status, _) = send(&t.app, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let owner = token(t.customer_id, AccountRole::Customer);
    let response = t
        .app
        .clone()
        .oneshot(request(Method::GET, &uri, Some(&owner), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = response.into_body().into_data_stream();
    let chunk = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.starts_with("event: snapshot"));
    assert!(text.contains(&t.delivery.id.to_string()));
}

#[tokio::test]
async fn test_health_and_metrics() {
    let t = test_app().await;

    let (status, body) = send(&t.app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    t.store.set_unavailable(true);
    let (_, body) = send(&t.app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(body["status"], "degraded");

    let response = t
        .app
        .clone()
        .oneshot(request(Method::GET, "/metrics", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
