mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{seed_delivery_option, test_config, TestApp};
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

use storefront_api::{api_v1_routes, payments::GatewayRegistry, services, AppState};

async fn test_router(app: &TestApp) -> Router {
    let cfg = test_config();
    let cart_service = Arc::new(app.cart_service());
    let order_service = Arc::new(app.order_service());
    let promotion_service = Arc::new(app.promotion_service());
    let gateways = Arc::new(GatewayRegistry::from_config(&cfg));
    let checkout_service = Arc::new(services::CheckoutService::new(
        app.db.clone(),
        app.cart_service(),
        app.order_service(),
        app.promotion_service(),
        gateways,
        app.event_sender.clone(),
    ));

    let state = AppState {
        db: app.db.clone(),
        config: cfg,
        event_sender: (*app.event_sender).clone(),
        cart_service,
        order_service,
        promotion_service,
        checkout_service,
    };

    Router::new().nest("/api/v1", api_v1_routes()).with_state(state)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn cart_endpoints_round_trip() {
    let app = TestApp::new().await;
    let router = test_router(&app).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/carts",
        Some(json!({ "session_id": "api-session" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cart_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/carts/{cart_id}/items"),
        Some(json!({
            "product_id": uuid::Uuid::new_v4(),
            "name": "Ceramic Mug",
            "unit_price": "25.00",
            "quantity": 2,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["quantity"], 2);

    let (status, body) = send(&router, "GET", &format!("/api/v1/carts/{cart_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_cart_returns_not_found_body() {
    let app = TestApp::new().await;
    let router = test_router(&app).await;

    let (status, body) = send(
        &router,
        "GET",
        &format!("/api/v1/carts/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn delivery_options_are_listed_in_position_order() {
    let app = TestApp::new().await;
    seed_delivery_option(&app, dec!(15.00)).await;
    let router = test_router(&app).await;

    let (status, body) = send(&router, "GET", "/api/v1/delivery-options", None).await;
    assert_eq!(status, StatusCode::OK);
    let options = body["data"].as_array().unwrap();
    assert_eq!(options.len(), 1);
    assert_eq!(options[0]["name"], "Courier");
}

#[tokio::test]
async fn checkout_rejects_an_unknown_coupon_with_422() {
    let app = TestApp::new().await;
    let router = test_router(&app).await;

    let (_, body) = send(
        &router,
        "POST",
        "/api/v1/carts",
        Some(json!({ "session_id": "api-coupon" })),
    )
    .await;
    let cart_id = body["data"]["id"].as_str().unwrap().to_string();
    send(
        &router,
        "POST",
        &format!("/api/v1/carts/{cart_id}/items"),
        Some(json!({
            "product_id": uuid::Uuid::new_v4(),
            "name": "Ceramic Mug",
            "unit_price": "25.00",
            "quantity": 1,
        })),
    )
    .await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/checkout",
        Some(json!({ "cart_id": cart_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/checkout/{session_id}/coupon"),
        Some(json!({ "code": "NOPE" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"].as_str().unwrap().contains("not found"));
}
