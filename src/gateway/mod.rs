//! Payment gateway adapter.
//!
//! Wraps the third-party payment API: signed transaction creation, the
//! client-facing payment package, and verification/decryption of inbound
//! callbacks under both supported envelope schemes.

pub mod callback;
mod client;
pub mod signing;

use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;
use std::time::Duration;
use utoipa::ToSchema;

use crate::config::GatewayConfig;
use crate::errors::ServiceError;
pub use callback::{PaymentNotification, TradeState};
use signing::{GatewayVerifier, MerchantSigner};

/// Parameters the client SDK needs to invoke the native payment sheet.
/// Signed over a different string than the server-to-gateway call.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ClientPayPackage {
    pub app_id: String,
    pub timestamp: String,
    pub nonce_str: String,
    pub package: String,
    pub sign_type: String,
    pub pay_sign: String,
}

/// Seam between the payment service and the wire. The production
/// implementation is [`PaymentGateway`]; tests substitute a stub.
#[async_trait]
pub trait TransactionGateway: Send + Sync {
    /// Creates a transaction at the gateway; returns the prepay id.
    async fn create_transaction(
        &self,
        out_trade_no: &str,
        description: &str,
        amount_total: i64,
    ) -> Result<String, ServiceError>;

    /// Builds the signed client payment package for a prepay id.
    fn client_pay_package(&self, prepay_id: &str) -> Result<ClientPayPackage, ServiceError>;
}

pub struct PaymentGateway {
    pub(crate) app_id: String,
    pub(crate) base_url: String,
    pub(crate) currency: String,
    pub(crate) notify_url: Option<String>,
    pub(crate) signer: MerchantSigner,
    verifier: GatewayVerifier,
    api_secret: [u8; 32],
    legacy_key: Option<String>,
    timestamp_tolerance_secs: i64,
    pub(crate) http: reqwest::Client,
}

impl PaymentGateway {
    /// Parses and validates all key material up front; a malformed key is
    /// `GatewayConfigInvalid` here rather than a surprise mid-payment.
    pub fn new(cfg: &GatewayConfig) -> Result<Self, ServiceError> {
        let signer = MerchantSigner::from_pem(
            &cfg.merchant_private_key_pem,
            cfg.merchant_id.clone(),
            cfg.merchant_serial.clone(),
        )?;
        let verifier = GatewayVerifier::from_pem(&cfg.gateway_public_key_pem)?;

        let api_secret: [u8; 32] = cfg.api_secret.as_bytes().try_into().map_err(|_| {
            ServiceError::GatewayConfigInvalid("api secret must be exactly 32 bytes".to_string())
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .map_err(|e| ServiceError::GatewayConfigInvalid(format!("http client: {}", e)))?;

        Ok(Self {
            app_id: cfg.app_id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            currency: cfg.currency.clone(),
            notify_url: cfg.notify_url.clone(),
            signer,
            verifier,
            api_secret,
            legacy_key: cfg.legacy_key.clone(),
            timestamp_tolerance_secs: cfg.timestamp_tolerance_secs,
            http,
        })
    }

    /// Verifies an inbound callback and yields the decrypted notification.
    ///
    /// Scheme selection is header-driven: the current scheme's signature
    /// header family when present, else the deprecated form-encoded digest.
    /// Any trust failure returns `Forbidden` before the Order Store is
    /// reachable.
    pub fn verify_and_decrypt_callback(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<PaymentNotification, ServiceError> {
        if callback::has_current_scheme_headers(headers) {
            callback::verify_current_scheme(
                &self.verifier,
                &self.api_secret,
                self.timestamp_tolerance_secs,
                headers,
                body,
            )
        } else if let Some(key) = &self.legacy_key {
            callback::verify_legacy_scheme(key, body)
        } else {
            Err(ServiceError::Forbidden(
                "callback carries no recognizable signature scheme".to_string(),
            ))
        }
    }
}

#[async_trait]
impl TransactionGateway for PaymentGateway {
    async fn create_transaction(
        &self,
        out_trade_no: &str,
        description: &str,
        amount_total: i64,
    ) -> Result<String, ServiceError> {
        client::create_transaction(self, out_trade_no, description, amount_total).await
    }

    fn client_pay_package(&self, prepay_id: &str) -> Result<ClientPayPackage, ServiceError> {
        let timestamp = chrono::Utc::now().timestamp();
        let nonce = client::nonce_str();
        let pay_sign = self
            .signer
            .sign_client_package(&self.app_id, timestamp, &nonce, prepay_id);

        Ok(ClientPayPackage {
            app_id: self.app_id.clone(),
            timestamp: timestamp.to_string(),
            nonce_str: nonce,
            package: format!("prepay_id={}", prepay_id),
            sign_type: "RSA".to_string(),
            pay_sign,
        })
    }
}
