use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use http::HeaderMap;
use md5::{Digest, Md5};
use serde::Deserialize;
use tracing::warn;

use crate::errors::ServiceError;
use crate::gateway::signing::{callback_message, GatewayVerifier};

/// AES-256-GCM nonces in the current envelope are always 12 bytes.
const GCM_NONCE_LEN: usize = 12;

pub const HEADER_TIMESTAMP: &str = "x-pay-timestamp";
pub const HEADER_NONCE: &str = "x-pay-nonce";
pub const HEADER_SIGNATURE: &str = "x-pay-signature";
pub const HEADER_SERIAL: &str = "x-pay-serial";

/// Terminal state the gateway reports for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeState {
    Success,
    Failed(String),
}

impl TradeState {
    pub fn is_success(&self) -> bool {
        matches!(self, TradeState::Success)
    }
}

/// A payment notification whose authenticity has been established. Only
/// values of this type ever reach the reconciliation service.
#[derive(Debug, Clone)]
pub struct PaymentNotification {
    /// External trade number: the only key the gateway shares with us
    pub trade_no: String,
    pub transaction_id: String,
    pub trade_state: TradeState,
    /// Opaque payer identity at the gateway
    pub payer_id: Option<String>,
    pub success_time: Option<DateTime<Utc>>,
    /// Amount in the gateway's minor currency unit
    pub amount_total: Option<i64>,
}

/// Envelope of the current callback scheme: signed JSON wrapping an
/// encrypted transaction resource.
#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    resource: EncryptedResource,
}

#[derive(Debug, Deserialize)]
struct EncryptedResource {
    algorithm: String,
    ciphertext: String,
    nonce: String,
    #[serde(default)]
    associated_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionResource {
    out_trade_no: String,
    transaction_id: String,
    trade_state: String,
    #[serde(default)]
    payer: Option<PayerResource>,
    #[serde(default)]
    success_time: Option<String>,
    #[serde(default)]
    amount: Option<AmountResource>,
}

#[derive(Debug, Deserialize)]
struct PayerResource {
    openid: String,
}

#[derive(Debug, Deserialize)]
struct AmountResource {
    total: i64,
}

/// Selects the envelope scheme from the inbound headers: the current scheme
/// always carries the signature header family, the deprecated one never does.
pub fn has_current_scheme_headers(headers: &HeaderMap) -> bool {
    headers.contains_key(HEADER_SIGNATURE)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ServiceError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Forbidden(format!("missing callback header {}", name)))
}

/// Verifies and decrypts a current-scheme callback.
///
/// Authenticity first: the signature over timestamp/nonce/body is checked
/// with the gateway public key before a single payload field is trusted,
/// and the timestamp must be within tolerance of the local clock.
pub fn verify_current_scheme(
    verifier: &GatewayVerifier,
    api_secret: &[u8; 32],
    timestamp_tolerance_secs: i64,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<PaymentNotification, ServiceError> {
    let timestamp = header_str(headers, HEADER_TIMESTAMP)?;
    let nonce = header_str(headers, HEADER_NONCE)?;
    let signature = header_str(headers, HEADER_SIGNATURE)?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ServiceError::Forbidden("malformed callback timestamp".to_string()))?;
    let skew = (Utc::now().timestamp() - ts).abs();
    if skew > timestamp_tolerance_secs {
        return Err(ServiceError::Forbidden(format!(
            "callback timestamp outside tolerance ({}s skew)",
            skew
        )));
    }

    let body_str = std::str::from_utf8(body)
        .map_err(|_| ServiceError::Forbidden("callback body is not utf-8".to_string()))?;
    verifier.verify(&callback_message(timestamp, nonce, body_str), signature)?;

    // Only now is the payload trusted enough to parse.
    let envelope: CallbackEnvelope = serde_json::from_str(body_str)
        .map_err(|e| ServiceError::Forbidden(format!("malformed callback envelope: {}", e)))?;

    let resource = decrypt_resource(api_secret, &envelope.resource)?;
    let transaction: TransactionResource = serde_json::from_slice(&resource)
        .map_err(|e| ServiceError::Forbidden(format!("malformed transaction resource: {}", e)))?;

    let trade_state = match transaction.trade_state.as_str() {
        "SUCCESS" => TradeState::Success,
        other => TradeState::Failed(other.to_string()),
    };

    let success_time = transaction
        .success_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(PaymentNotification {
        trade_no: transaction.out_trade_no,
        transaction_id: transaction.transaction_id,
        trade_state,
        payer_id: transaction.payer.map(|p| p.openid),
        success_time,
        amount_total: transaction.amount.map(|a| a.total),
    })
}

fn decrypt_resource(
    api_secret: &[u8; 32],
    resource: &EncryptedResource,
) -> Result<Vec<u8>, ServiceError> {
    if resource.algorithm != "AEAD_AES_256_GCM" {
        return Err(ServiceError::Forbidden(format!(
            "unsupported resource algorithm {}",
            resource.algorithm
        )));
    }
    if resource.nonce.len() != GCM_NONCE_LEN {
        return Err(ServiceError::Forbidden(
            "malformed resource nonce".to_string(),
        ));
    }

    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(&resource.ciphertext)
        .map_err(|_| ServiceError::Forbidden("malformed resource ciphertext".to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(api_secret)
        .map_err(|_| ServiceError::GatewayConfigInvalid("api secret is not 32 bytes".to_string()))?;
    let nonce = Nonce::from_slice(resource.nonce.as_bytes());
    let aad = resource.associated_data.as_deref().unwrap_or("");

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| ServiceError::Forbidden("resource decryption failed".to_string()))
}

/// Verifies a deprecated-scheme callback: form-encoded pairs with an MD5
/// digest keyed by a shared secret.
pub fn verify_legacy_scheme(
    legacy_key: &str,
    body: &[u8],
) -> Result<PaymentNotification, ServiceError> {
    let body_str = std::str::from_utf8(body)
        .map_err(|_| ServiceError::Forbidden("callback body is not utf-8".to_string()))?;

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut provided_sign = None;
    for field in body_str.split('&') {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        if key == "sign" {
            provided_sign = Some(value.to_string());
        } else if !value.is_empty() {
            pairs.push((key.to_string(), value.to_string()));
        }
    }

    let provided_sign =
        provided_sign.ok_or_else(|| ServiceError::Forbidden("missing sign field".to_string()))?;

    let expected = legacy_sign(&pairs, legacy_key);
    if !constant_time_eq(&expected, &provided_sign) {
        return Err(ServiceError::Forbidden(
            "legacy callback digest mismatch".to_string(),
        ));
    }

    let field = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let trade_no = field("out_trade_no")
        .ok_or_else(|| ServiceError::Forbidden("missing out_trade_no".to_string()))?;
    let transaction_id = field("transaction_id")
        .ok_or_else(|| ServiceError::Forbidden("missing transaction_id".to_string()))?;

    let trade_state = match field("result_code").as_deref() {
        Some("SUCCESS") => TradeState::Success,
        Some(other) => TradeState::Failed(other.to_string()),
        None => TradeState::Failed("MISSING_RESULT_CODE".to_string()),
    };

    let success_time = field("time_end").and_then(|raw| parse_legacy_time(&raw));
    if success_time.is_none() && trade_state.is_success() {
        warn!(trade_no = %trade_no, "legacy callback success without parseable time_end");
    }

    Ok(PaymentNotification {
        trade_no,
        transaction_id,
        trade_state,
        payer_id: field("openid"),
        success_time,
        amount_total: field("total_fee").and_then(|v| v.parse().ok()),
    })
}

/// Digest of the deprecated scheme: MD5 over the key-sorted `k=v` pairs
/// joined with `&`, with the shared secret appended, uppercase hex.
pub fn legacy_sign(pairs: &[(String, String)], key: &str) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = String::new();
    for (k, v) in sorted {
        buf.push_str(k);
        buf.push('=');
        buf.push_str(v);
        buf.push('&');
    }
    buf.push_str("key=");
    buf.push_str(key);

    let digest = Md5::digest(buf.as_bytes());
    hex::encode_upper(digest)
}

fn parse_legacy_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
