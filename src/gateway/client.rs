use chrono::Utc;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::{error, instrument, warn};

use crate::errors::ServiceError;
use crate::gateway::PaymentGateway;

/// Gateway endpoint for creating a transaction.
pub(super) const CREATE_TRANSACTION_PATH: &str = "/v3/pay/transactions";

/// Random nonce for request freshness.
pub(super) fn nonce_str() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Calls the gateway's create-transaction endpoint with a signed request
/// and returns the prepay id.
///
/// No automatic retry lives here; a failed call surfaces to the caller,
/// which may retry the whole payment-intent operation once.
#[instrument(skip(gateway), fields(out_trade_no = %out_trade_no))]
pub(super) async fn create_transaction(
    gateway: &PaymentGateway,
    out_trade_no: &str,
    description: &str,
    amount_total: i64,
) -> Result<String, ServiceError> {
    let body = json!({
        "app_id": gateway.app_id,
        "mchid": gateway.signer.merchant_id,
        "description": description,
        "out_trade_no": out_trade_no,
        "notify_url": gateway.notify_url,
        "amount": {
            "total": amount_total,
            "currency": gateway.currency,
        },
    })
    .to_string();

    let timestamp = Utc::now().timestamp();
    let nonce = nonce_str();
    let authorization = gateway.signer.authorization_header(
        "POST",
        CREATE_TRANSACTION_PATH,
        timestamp,
        &nonce,
        &body,
    );

    let url = format!("{}{}", gateway.base_url, CREATE_TRANSACTION_PATH);
    let response = gateway
        .http
        .post(&url)
        .header(AUTHORIZATION, authorization)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| {
            error!(error = %e, "gateway request failed");
            ServiceError::ExternalServiceError(format!("gateway unreachable: {}", e))
        })?;

    let status = response.status();
    let payload: serde_json::Value = response.json().await.map_err(|e| {
        error!(error = %e, "gateway response was not json");
        ServiceError::ExternalServiceError(format!("malformed gateway response: {}", e))
    })?;

    if !status.is_success() {
        let code = payload
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("gateway rejected the transaction")
            .to_string();
        warn!(%status, code = %code, "gateway rejected create-transaction");
        return Err(ServiceError::GatewayRejected { code, message });
    }

    payload
        .get("prepay_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ServiceError::ExternalServiceError("gateway response missing prepay_id".to_string())
        })
}
