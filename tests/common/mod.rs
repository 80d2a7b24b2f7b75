#![allow(dead_code)]

use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

use storefront_api::{
    config::{AppConfig, GatewayConfig, SweepConfig},
    db,
    entities::{order, order_item, product},
    events::{self, EventSender},
    gateway::signing::{callback_message, MerchantSigner},
    gateway::PaymentGateway,
    services::orders::{PlaceOrderItem, PlaceOrderRequest},
    AppState,
};

pub const API_SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const LEGACY_KEY: &str = "legacy-shared-secret";

// Key generation is slow; one pair serves every test in the binary. The
// same key plays both roles: merchant signing key and gateway platform key.
static TEST_KEY: Lazy<RsaPrivateKey> =
    Lazy::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate test key"));

fn private_key_pem() -> String {
    TEST_KEY
        .to_pkcs8_pem(LineEnding::LF)
        .expect("encode private key")
        .to_string()
}

fn public_key_pem() -> String {
    TEST_KEY
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .expect("encode public key")
}

/// Test harness: file-backed SQLite, real services, real gateway adapter
/// pointed at a wiremock server.
pub struct TestApp {
    pub state: AppState,
    pub gateway_server: MockServer,
    router: Router,
    db_path: std::path::PathBuf,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let gateway_server = MockServer::start().await;

        let db_path =
            std::env::temp_dir().join(format!("storefront_test_{}.db", Uuid::new_v4().simple()));
        let database_url = format!("sqlite://{}?mode=rwc", db_path.display());

        let cfg = AppConfig {
            database_url: database_url.clone(),
            host: "127.0.0.1".to_string(),
            port: 18_080,
            environment: "test".to_string(),
            log_level: "warn".to_string(),
            log_json: false,
            auto_migrate: true,
            gateway: GatewayConfig {
                base_url: gateway_server.uri(),
                app_id: "app-test".to_string(),
                merchant_id: "merchant-test".to_string(),
                merchant_serial: "TESTSERIAL".to_string(),
                merchant_private_key_pem: private_key_pem(),
                gateway_public_key_pem: public_key_pem(),
                api_secret: API_SECRET.to_string(),
                legacy_key: Some(LEGACY_KEY.to_string()),
                notify_url: Some("https://shop.example.com/api/v1/payments/notify".to_string()),
                http_timeout_secs: 5,
                timestamp_tolerance_secs: 300,
                currency: "CNY".to_string(),
            },
            sweep: SweepConfig::default(),
        };

        let pool = db::establish_connection(&database_url)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(PaymentGateway::new(&cfg.gateway).expect("valid test gateway"));
        let state = AppState::new(db_arc, cfg, event_sender, gateway);

        let router = Router::new()
            .merge(storefront_api::health_routes())
            .nest("/api/v1", storefront_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            state,
            gateway_server,
            router,
            db_path,
            _event_task: event_task,
        }
    }

    // ---- HTTP ----

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        buyer: Option<Uuid>,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(buyer) = buyer {
            builder = builder.header("x-buyer-id", buyer.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("serialize request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn notify(
        &self,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/notify");
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        let request = builder.body(Body::from(body)).expect("build notify request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during notify")
    }

    // ---- Seeding and lookups ----

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            image_url: Set(None),
            price: Set(price),
            stock: Set(stock),
            locked_stock: Set(0),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        model.insert(&*self.state.db).await.expect("seed product")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn order_items(&self, id: Uuid) -> Vec<order_item::Model> {
        use sea_orm::{ColumnTrait, QueryFilter};
        order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(id))
            .all(&*self.state.db)
            .await
            .expect("query order items")
    }

    /// Places an order through the service and returns its id.
    pub async fn place_order(&self, buyer: Uuid, items: &[(Uuid, i32)]) -> Uuid {
        let request = PlaceOrderRequest {
            items: items
                .iter()
                .map(|(product_id, quantity)| PlaceOrderItem {
                    product_id: *product_id,
                    quantity: *quantity,
                })
                .collect(),
            receiver_name: "Test Buyer".to_string(),
            receiver_phone: "13800000000".to_string(),
            receiver_address: "1 Example Road, Example City".to_string(),
        };
        self.state
            .orders
            .place_order(buyer, request)
            .await
            .expect("place order")
            .id
    }

    /// Stamps a trade number and opens the payment window, as a payment
    /// intent would, without the gateway round trip.
    pub async fn open_payment_window(
        &self,
        order_id: Uuid,
        trade_no: &str,
        opened_at: DateTime<Utc>,
    ) {
        let order = self.order(order_id).await;
        let mut active: order::ActiveModel = order.into();
        active.trade_no = Set(Some(trade_no.to_string()));
        active.cancel_pay_time = Set(Some(opened_at));
        active.update(&*self.state.db).await.expect("stamp trade_no");
    }

    // ---- Callback construction ----

    /// Signs and encrypts a current-scheme success callback for a trade
    /// number, exactly as the gateway would.
    pub fn signed_success_callback(
        &self,
        trade_no: &str,
        transaction_id: &str,
        success_time: DateTime<Utc>,
    ) -> (Vec<(&'static str, String)>, Vec<u8>) {
        let resource = json!({
            "out_trade_no": trade_no,
            "transaction_id": transaction_id,
            "trade_state": "SUCCESS",
            "success_time": success_time.to_rfc3339(),
            "payer": { "openid": "payer-1" },
            "amount": { "total": 1299 },
        });
        self.signed_callback(&resource)
    }

    pub fn signed_failure_callback(
        &self,
        trade_no: &str,
        transaction_id: &str,
    ) -> (Vec<(&'static str, String)>, Vec<u8>) {
        let resource = json!({
            "out_trade_no": trade_no,
            "transaction_id": transaction_id,
            "trade_state": "PAYERROR",
        });
        self.signed_callback(&resource)
    }

    fn signed_callback(&self, resource: &Value) -> (Vec<(&'static str, String)>, Vec<u8>) {
        let nonce_str = "0123456789ab";
        let cipher = Aes256Gcm::new_from_slice(API_SECRET.as_bytes()).unwrap();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(nonce_str.as_bytes()),
                Payload {
                    msg: resource.to_string().as_bytes(),
                    aad: b"transaction",
                },
            )
            .expect("encrypt resource");

        let body = json!({
            "id": Uuid::new_v4().to_string(),
            "event_type": "TRANSACTION.SUCCESS",
            "resource": {
                "algorithm": "AEAD_AES_256_GCM",
                "ciphertext": base64::engine::general_purpose::STANDARD.encode(ciphertext),
                "nonce": nonce_str,
                "associated_data": "transaction",
            },
        })
        .to_string()
        .into_bytes();

        let timestamp = Utc::now().timestamp().to_string();
        let nonce = "callback-nonce-1".to_string();
        let signer = MerchantSigner::from_pem(&private_key_pem(), "gw".into(), "GWSERIAL".into())
            .expect("test signer");
        let signature = signer.sign(&callback_message(
            &timestamp,
            &nonce,
            std::str::from_utf8(&body).unwrap(),
        ));

        (
            vec![
                ("x-pay-timestamp", timestamp),
                ("x-pay-nonce", nonce),
                ("x-pay-signature", signature),
                ("x-pay-serial", "GWSERIAL".to_string()),
            ],
            body,
        )
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        let _ = std::fs::remove_file(&self.db_path);
    }
}
