//! Storefront API Library
//!
//! Order lifecycle core: inventory reservation, payment intents, gateway
//! reconciliation and auto-cancellation of unpaid orders.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod context;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::gateway::PaymentGateway;
use crate::services::autocancel::AutoCancelService;
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::services::reconciliation::ReconciliationService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub gateway: Arc<PaymentGateway>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub autocancel: Arc<AutoCancelService>,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cfg: config::AppConfig,
        event_sender: events::EventSender,
        gateway: Arc<PaymentGateway>,
    ) -> Self {
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            cfg.gateway.currency.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            gateway.clone(),
            event_sender.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            event_sender.clone(),
        ));
        let autocancel = Arc::new(AutoCancelService::new(
            db.clone(),
            event_sender.clone(),
            &cfg.sweep,
        ));

        Self {
            db,
            config: cfg,
            event_sender,
            gateway,
            orders,
            payments,
            reconciliation,
            autocancel,
        }
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrapper: every operation boundary speaks this shape on
// success and `errors::ErrorResponse` on failure.
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// The versioned API surface.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/orders",
            post(handlers::orders::place_order).get(handlers::orders::list_orders),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/receipt", post(handlers::orders::confirm_receipt))
        .route("/orders/:id/refund", post(handlers::orders::request_refund))
        .route("/orders/:id/status", post(handlers::orders::update_status))
        .route("/orders/:id/expire", post(handlers::orders::expire_order))
        .route(
            "/orders/:id/pay",
            post(handlers::payments::create_payment_intent),
        )
        .route(
            "/payments/notify",
            post(handlers::payment_webhooks::payment_notify),
        )
}

/// Health and liveness routes, mounted outside the versioned API.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
}
