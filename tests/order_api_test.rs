mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, read_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_payments::{
    entities::order::{OrderStatus, PaymentMethod},
    gateways::GatewayRegistry,
};
use uuid::Uuid;

fn order_body(product_id: Uuid, quantity: i32) -> serde_json::Value {
    json!({
        "items": [{ "product_id": product_id, "quantity": quantity }],
        "payment_method": "card",
        "shipping_address": {
            "name": "Amina Otieno",
            "line1": "4 Kenyatta Road",
            "city": "Nairobi",
            "country": "KE",
            "phone": "0712345678"
        },
        "customer_email": "amina@example.com"
    })
}

#[tokio::test]
async fn create_order_prices_from_catalog() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-1", dec!(20.00), 5).await;
    let user = Uuid::new_v4();

    let response = app
        .as_user(Method::POST, "/api/v1/orders", Some(order_body(product.id, 1)), user)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = read_json(response).await;
    let order = &body["data"];
    assert_eq!(order["status"], "pending");
    assert_eq!(decimal(&order["subtotal"]), dec!(20.00));
    assert_eq!(decimal(&order["tax"]), dec!(3.00));
    assert_eq!(decimal(&order["shipping"]), dec!(10.00));
    assert_eq!(decimal(&order["total"]), dec!(33.00));
    assert_eq!(order["currency"], "USD");
    assert_eq!(order["user_id"], user.to_string());
    assert_eq!(order["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(order["items"][0]["product_name"], "Product MUG-1");
}

#[tokio::test]
async fn orders_above_threshold_ship_free() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("LAMP-1", dec!(60.00), 5).await;

    let response = app
        .as_user(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(product.id, 2)),
            Uuid::new_v4(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let order = read_json(response).await["data"].clone();
    assert_eq!(decimal(&order["subtotal"]), dec!(120.00));
    assert_eq!(decimal(&order["tax"]), dec!(18.00));
    assert_eq!(decimal(&order["shipping"]), dec!(0));
    assert_eq!(decimal(&order["total"]), dec!(138.00));
}

#[tokio::test]
async fn create_order_requires_identity() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-2", dec!(20.00), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(product.id, 1)),
            None,
            false,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_orders_are_rejected() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-3", dec!(20.00), 5).await;
    let user = Uuid::new_v4();

    let mut empty = order_body(product.id, 1);
    empty["items"] = json!([]);
    let response = app
        .as_user(Method::POST, "/api/v1/orders", Some(empty), user)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .as_user(Method::POST, "/api/v1/orders", Some(order_body(product.id, 0)), user)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .as_user(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(Uuid::new_v4(), 1)),
            user,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn orders_are_visible_to_owner_and_admins_only() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-4", dec!(20.00), 5).await;
    let owner = Uuid::new_v4();
    let order = app
        .place_order(owner, &[(product.id, 1)], PaymentMethod::Card)
        .await
        .order;
    let uri = format!("/api/v1/orders/{}", order.id);

    let response = app.as_user(Method::GET, &uri, None, owner).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"]["id"], order.id.to_string());

    let response = app.as_user(Method::GET, &uri, None, Uuid::new_v4()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.as_admin(Method::GET, &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .as_user(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            owner,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn users_list_only_their_own_orders_newest_first() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-6", dec!(20.00), 10).await;
    let owner = Uuid::new_v4();
    let first = app.place_order(owner, &[(product.id, 1)], PaymentMethod::Card).await.order;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = app.place_order(owner, &[(product.id, 2)], PaymentMethod::Mpesa).await.order;
    app.place_order(Uuid::new_v4(), &[(product.id, 1)], PaymentMethod::Card)
        .await;

    let response = app.as_user(Method::GET, "/api/v1/orders", None, owner).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    let ids: Vec<String> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec![second.id.to_string(), first.id.to_string()]);

    let response = app
        .as_user(Method::GET, "/api/v1/orders", None, Uuid::new_v4())
        .await;
    assert_eq!(read_json(response).await["data"], json!([]));

    let response = app
        .request(Method::GET, "/api/v1/orders", None, None, false)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_updates_are_admin_only_and_follow_the_state_machine() {
    let app = TestApp::new(GatewayRegistry::new()).await;
    let product = app.seed_product("MUG-5", dec!(20.00), 5).await;
    let owner = Uuid::new_v4();
    let order = app
        .place_order(owner, &[(product.id, 1)], PaymentMethod::Card)
        .await
        .order;
    let uri = format!("/api/v1/orders/{}/status", order.id);

    let response = app
        .as_user(Method::POST, &uri, Some(json!({ "status": "cancelled" })), owner)
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Payment statuses are owned by reconciliation
    let response = app
        .as_admin(Method::POST, &uri, Some(json!({ "status": "paid" })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .as_admin(Method::POST, &uri, Some(json!({ "status": "shipped" })))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .as_admin(Method::POST, &uri, Some(json!({ "status": "cancelled" })))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"]["status"], "cancelled");
    assert!(!body["data"]["cancelled_at"].is_null());

    assert_eq!(app.order(order.id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn review_queue_requires_admin() {
    let app = TestApp::new(GatewayRegistry::new()).await;

    let response = app
        .as_user(Method::GET, "/api/v1/admin/orders/review", None, Uuid::new_v4())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .as_admin(Method::GET, "/api/v1/admin/orders/review", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let app = TestApp::new(GatewayRegistry::new()).await;

    let response = app.request(Method::GET, "/health", None, None, false).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(Method::GET, "/health/ready", None, None, false)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    // No providers configured
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["details"]["database"]["status"], "up");

    let response = app
        .request(Method::GET, "/api-docs/openapi.json", None, None, false)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert!(body["paths"]["/api/v1/orders"].is_object());
}
