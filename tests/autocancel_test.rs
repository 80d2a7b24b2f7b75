//! Auto-cancellation sweep: reclaiming reservations from orders stuck in
//! the payment window, batch isolation and the single-order trigger.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use uuid::Uuid;

use storefront_api::errors::ServiceError;
use storefront_api::gateway::{PaymentNotification, TradeState};

#[tokio::test]
async fn scenario_b_expired_pending_order_is_swept() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Lantern", dec!(14.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 4)]).await;

    // Payment window opened 16 minutes ago; the 15-minute deadline passed.
    app.open_payment_window(order_id, "TSWEEP-1", Utc::now() - Duration::minutes(16))
        .await;

    let outcome = app
        .state
        .autocancel
        .sweep_expired_orders(100)
        .await
        .expect("sweep");
    assert_eq!(outcome.cancelled, 1);
    assert_eq!(outcome.failed, 0);

    let order = app.order(order_id).await;
    assert_eq!(order.status, "cancelled");
    assert_eq!(order.auto_cancel_status, "cancelled");
    assert_eq!(app.product(p.id).await.locked_stock, 0);
}

#[tokio::test]
async fn sweep_leaves_fresh_and_windowless_orders_alone() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Candle", dec!(3.00), 20).await;

    // Window still open.
    let fresh = app.place_order(buyer, &[(p.id, 1)]).await;
    app.open_payment_window(fresh, "TFRESH-1", Utc::now() - Duration::minutes(5))
        .await;

    // No payment intent yet: no window, nothing to reclaim.
    let windowless = app.place_order(buyer, &[(p.id, 1)]).await;

    let outcome = app.state.autocancel.sweep_expired_orders(100).await.unwrap();
    assert_eq!(outcome.cancelled, 0);

    assert_eq!(app.order(fresh).await.status, "pending");
    assert_eq!(app.order(windowless).await.status, "pending");
    assert_eq!(app.product(p.id).await.locked_stock, 2);
}

#[tokio::test]
async fn sweep_skips_orders_that_got_paid() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Torch", dec!(9.00), 20).await;

    let expired = app.place_order(buyer, &[(p.id, 2)]).await;
    app.open_payment_window(expired, "TMIX-1", Utc::now() - Duration::minutes(20))
        .await;

    let paid = app.place_order(buyer, &[(p.id, 3)]).await;
    app.open_payment_window(paid, "TMIX-2", Utc::now() - Duration::minutes(20))
        .await;
    let notification = PaymentNotification {
        trade_no: "TMIX-2".to_string(),
        transaction_id: "GW-SWEEP".to_string(),
        trade_state: TradeState::Success,
        payer_id: None,
        success_time: Some(Utc::now()),
        amount_total: None,
    };
    app.state
        .reconciliation
        .apply_payment_result(&notification)
        .await
        .unwrap();

    let outcome = app.state.autocancel.sweep_expired_orders(100).await.unwrap();
    // Only the unpaid expired order is reclaimed; the paid one left the
    // sweep's selection by its auto_cancel_status.
    assert_eq!(outcome.cancelled, 1);

    assert_eq!(app.order(expired).await.status, "cancelled");
    assert_eq!(app.order(paid).await.status, "paid");
    // Paid order keeps its reservation.
    assert_eq!(app.product(p.id).await.locked_stock, 3);
}

#[tokio::test]
async fn batch_limit_bounds_one_run() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Bulb", dec!(1.50), 50).await;

    for i in 0..3 {
        let order_id = app.place_order(buyer, &[(p.id, 1)]).await;
        app.open_payment_window(
            order_id,
            &format!("TBATCH-{}", i),
            Utc::now() - Duration::minutes(30),
        )
        .await;
    }

    let first = app.state.autocancel.sweep_expired_orders(2).await.unwrap();
    assert_eq!(first.cancelled, 2);

    let second = app.state.autocancel.sweep_expired_orders(2).await.unwrap();
    assert_eq!(second.cancelled, 1);

    assert_eq!(app.product(p.id).await.locked_stock, 0);
}

#[tokio::test]
async fn single_order_trigger_shares_the_sweep_semantics() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Switch", dec!(5.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 2)]).await;
    app.open_payment_window(order_id, "TTRIGGER-1", Utc::now() - Duration::minutes(16))
        .await;

    // Client countdown fires the HTTP trigger.
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/expire", order_id),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = app.order(order_id).await;
    assert_eq!(order.status, "cancelled");
    assert_eq!(app.product(p.id).await.locked_stock, 0);
}

#[tokio::test]
async fn trigger_rejects_unexpired_window() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Dimmer", dec!(7.00), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 1)]).await;
    app.open_payment_window(order_id, "TEARLY-1", Utc::now() - Duration::minutes(5))
        .await;

    let err = app.state.autocancel.cancel_expired(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));
    assert_eq!(app.order(order_id).await.status, "pending");
    assert_eq!(app.product(p.id).await.locked_stock, 1);

    // An order with no window at all is likewise rejected.
    let no_window = app.place_order(buyer, &[(p.id, 1)]).await;
    let err = app.state.autocancel.cancel_expired(no_window).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));
}

#[tokio::test]
async fn trigger_is_idempotent_against_the_sweep() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let p = app.seed_product("Socket", dec!(2.50), 10).await;
    let order_id = app.place_order(buyer, &[(p.id, 2)]).await;
    app.open_payment_window(order_id, "TBOTH-1", Utc::now() - Duration::minutes(20))
        .await;

    // Sweep wins; the client trigger then finds nothing to do.
    let outcome = app.state.autocancel.sweep_expired_orders(10).await.unwrap();
    assert_eq!(outcome.cancelled, 1);

    let err = app.state.autocancel.cancel_expired(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));

    // Released exactly once.
    assert_eq!(app.product(p.id).await.locked_stock, 0);
}
