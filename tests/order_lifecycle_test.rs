//! End-to-end coverage of order placement, cancellation and the status
//! guards, against a real database through the real migrator.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use storefront_api::entities::order::{OrderStatus, PAY_STATUS_PAID};
use storefront_api::errors::ServiceError;
use storefront_api::gateway::{PaymentNotification, TradeState};
use storefront_api::services::orders::{PlaceOrderItem, PlaceOrderRequest};

fn place_request(items: Vec<PlaceOrderItem>) -> PlaceOrderRequest {
    PlaceOrderRequest {
        items,
        receiver_name: "Test Buyer".into(),
        receiver_phone: "13800000000".into(),
        receiver_address: "1 Example Road, Example City".into(),
    }
}

async fn mark_paid(app: &TestApp, order_id: Uuid, trade_no: &str) {
    app.open_payment_window(order_id, trade_no, Utc::now()).await;
    let notification = PaymentNotification {
        trade_no: trade_no.to_string(),
        transaction_id: format!("GW-{}", trade_no),
        trade_state: TradeState::Success,
        payer_id: Some("payer-1".into()),
        success_time: Some(Utc::now()),
        amount_total: None,
    };
    app.state
        .reconciliation
        .apply_payment_result(&notification)
        .await
        .expect("apply payment");
}

#[tokio::test]
async fn scenario_a_oversell_is_blocked() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Teapot", dec!(25.00), 10).await;

    // Exactly the available amount succeeds.
    app.place_order(buyer, &[(p.id, 10)]).await;
    assert_eq!(app.product(p.id).await.locked_stock, 10);

    // One more unit fails and leaves the ledger untouched.
    let err = app
        .state
        .orders
        .place_order(buyer, place_request(vec![PlaceOrderItem { product_id: p.id, quantity: 1 }]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::OutOfStock(_));
    assert_eq!(app.product(p.id).await.locked_stock, 10);
}

#[tokio::test]
async fn boundary_available_plus_one_fails_cleanly() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Mug", dec!(8.00), 7).await;

    // Partially lock the product, then ask for exactly what is left.
    app.place_order(buyer, &[(p.id, 3)]).await;
    app.place_order(buyer, &[(p.id, 4)]).await;
    assert_eq!(app.product(p.id).await.locked_stock, 7);

    let err = app
        .state
        .orders
        .place_order(buyer, place_request(vec![PlaceOrderItem { product_id: p.id, quantity: 1 }]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::OutOfStock(_));
    assert_eq!(app.product(p.id).await.locked_stock, 7);
}

#[tokio::test]
async fn place_then_cancel_round_trips_the_ledger() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p1 = app.seed_product("Plate", dec!(12.50), 20).await;
    let p2 = app.seed_product("Bowl", dec!(9.00), 5).await;

    let order_id = app.place_order(buyer, &[(p1.id, 2), (p2.id, 5)]).await;
    assert_eq!(app.product(p1.id).await.locked_stock, 2);
    assert_eq!(app.product(p2.id).await.locked_stock, 5);

    app.state
        .orders
        .cancel_order(buyer, order_id)
        .await
        .expect("cancel order");

    // Every touched product is back to its pre-order value.
    assert_eq!(app.product(p1.id).await.locked_stock, 0);
    assert_eq!(app.product(p2.id).await.locked_stock, 0);

    let order = app.order(order_id).await;
    assert_eq!(order.status, "cancelled");
    assert_eq!(order.auto_cancel_status, "cancelled");
    for item in app.order_items(order_id).await {
        assert_eq!(item.locked_quantity, 0);
    }
}

#[tokio::test]
async fn locked_stock_equals_sum_of_pending_reservations() {
    let app = TestApp::new().await;
    let p = app.seed_product("Vase", dec!(30.00), 100).await;

    let buyer_a = Uuid::new_v4();
    let buyer_b = Uuid::new_v4();
    let o1 = app.place_order(buyer_a, &[(p.id, 10)]).await;
    let o2 = app.place_order(buyer_b, &[(p.id, 7)]).await;
    let _o3 = app.place_order(buyer_a, &[(p.id, 3)]).await;
    assert_eq!(app.product(p.id).await.locked_stock, 20);

    // Cancelling one order removes exactly its share.
    app.state.orders.cancel_order(buyer_a, o1).await.unwrap();
    assert_eq!(app.product(p.id).await.locked_stock, 10);

    // Payment keeps the reservation locked (consumed later by fulfillment).
    mark_paid(&app, o2, "TINV-1").await;
    assert_eq!(app.product(p.id).await.locked_stock, 10);
}

#[tokio::test]
async fn cancel_is_guarded_against_double_release() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Cup", dec!(4.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 4)]).await;

    app.state.orders.cancel_order(buyer, order_id).await.unwrap();
    assert_eq!(app.product(p.id).await.locked_stock, 0);

    // Second cancel is rejected, not a second release.
    let err = app
        .state
        .orders
        .cancel_order(buyer, order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));
    assert_eq!(app.product(p.id).await.locked_stock, 0);
}

#[tokio::test]
async fn only_the_owner_may_act_on_an_order() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let p = app.seed_product("Pot", dec!(15.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 1)]).await;

    let err = app
        .state
        .orders
        .cancel_order(stranger, order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));

    let err = app
        .state
        .orders
        .get_order(stranger, order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn full_happy_path_to_completion() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Kettle", dec!(45.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 1)]).await;

    mark_paid(&app, order_id, "THAPPY-1").await;
    let order = app.order(order_id).await;
    assert_eq!(order.status, "paid");
    assert_eq!(order.pay_status, PAY_STATUS_PAID);

    // Receipt confirmation requires shipment first.
    let err = app
        .state
        .orders
        .confirm_receipt(buyer, order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));

    app.state
        .orders
        .update_status(order_id, OrderStatus::Shipped)
        .await
        .unwrap();
    app.state
        .orders
        .confirm_receipt(buyer, order_id)
        .await
        .unwrap();
    assert_eq!(app.order(order_id).await.status, "completed");
}

#[tokio::test]
async fn refund_request_only_from_paid_or_shipped() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Tray", dec!(22.00), 10).await;

    let pending = app.place_order(buyer, &[(p.id, 1)]).await;
    let err = app
        .state
        .orders
        .request_refund(buyer, pending)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));

    let paid = app.place_order(buyer, &[(p.id, 1)]).await;
    mark_paid(&app, paid, "TREFUND-1").await;
    app.state.orders.request_refund(buyer, paid).await.unwrap();
    assert_eq!(app.order(paid).await.status, "refunding");

    // Settlement is a collaborator transition.
    app.state
        .orders
        .update_status(paid, OrderStatus::Refunded)
        .await
        .unwrap();
    assert_eq!(app.order(paid).await.status, "refunded");
}

#[tokio::test]
async fn update_status_rejects_non_collaborator_transitions() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Jar", dec!(6.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 1)]).await;

    for target in [
        OrderStatus::Paid,
        OrderStatus::Shipped,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ] {
        let err = app
            .state
            .orders
            .update_status(order_id, target)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidTransition(_));
    }
    assert_eq!(app.order(order_id).await.status, "pending");
}

#[tokio::test]
async fn validation_rejects_bad_requests_before_storage() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Fork", dec!(2.00), 10).await;

    // Empty cart.
    let err = app
        .state
        .orders
        .place_order(buyer, place_request(vec![]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Zero quantity.
    let err = app
        .state
        .orders
        .place_order(buyer, place_request(vec![PlaceOrderItem { product_id: p.id, quantity: 0 }]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Missing address text.
    let mut request = place_request(vec![PlaceOrderItem { product_id: p.id, quantity: 1 }]);
    request.receiver_address = String::new();
    let err = app.state.orders.place_order(buyer, request).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // Unknown product.
    let err = app
        .state
        .orders
        .place_order(
            buyer,
            place_request(vec![PlaceOrderItem { product_id: Uuid::new_v4(), quantity: 1 }]),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    // Nothing was reserved by any of the rejected attempts.
    assert_eq!(app.product(p.id).await.locked_stock, 0);
}

#[tokio::test]
async fn http_surface_places_and_reads_orders() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Spoon", dec!(3.00), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(buyer),
            Some(json!({
                "items": [{ "product_id": p.id, "quantity": 2 }],
                "receiver_name": "Test Buyer",
                "receiver_phone": "13800000000",
                "receiver_address": "1 Example Road, Example City",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Identity is mandatory on buyer-facing routes.
    let response = app.request(Method::GET, "/api/v1/orders", None, None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(Method::GET, "/api/v1/orders", Some(buyer), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
