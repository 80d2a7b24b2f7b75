use base64::Engine;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::errors::ServiceError;

/// Merchant-side signer for outbound gateway requests and the client
/// payment package. Key material is parsed once at construction; malformed
/// PEM is a configuration error, not a runtime one.
#[derive(Clone, Debug)]
pub struct MerchantSigner {
    signing_key: SigningKey<Sha256>,
    pub merchant_id: String,
    pub serial: String,
}

impl MerchantSigner {
    pub fn from_pem(
        private_key_pem: &str,
        merchant_id: String,
        serial: String,
    ) -> Result<Self, ServiceError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).map_err(|e| {
            ServiceError::GatewayConfigInvalid(format!("merchant private key: {}", e))
        })?;

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            merchant_id,
            serial,
        })
    }

    /// RSA-SHA256 over an already-canonicalized message, base64-encoded.
    pub fn sign(&self, message: &str) -> String {
        let signature = self.signing_key.sign(message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    /// Signature for a server-to-gateway API call. The signed string is the
    /// request line plus freshness material, one field per line.
    pub fn sign_request(
        &self,
        method: &str,
        path: &str,
        timestamp: i64,
        nonce: &str,
        body: &str,
    ) -> String {
        let message = format!("{}\n{}\n{}\n{}\n{}\n", method, path, timestamp, nonce, body);
        self.sign(&message)
    }

    /// `Authorization` header value for a signed gateway call.
    pub fn authorization_header(
        &self,
        method: &str,
        path: &str,
        timestamp: i64,
        nonce: &str,
        body: &str,
    ) -> String {
        let signature = self.sign_request(method, path, timestamp, nonce, body);
        format!(
            "SP-RSA-SHA256 mchid=\"{}\",nonce_str=\"{}\",timestamp=\"{}\",serial_no=\"{}\",signature=\"{}\"",
            self.merchant_id, nonce, timestamp, self.serial, signature
        )
    }

    /// Signature for the client-facing payment package. Deliberately a
    /// different signing string than the server call: the client SDK signs
    /// over app identity and the prepay id only.
    pub fn sign_client_package(
        &self,
        app_id: &str,
        timestamp: i64,
        nonce: &str,
        prepay_id: &str,
    ) -> String {
        let message = format!("{}\n{}\n{}\nprepay_id={}\n", app_id, timestamp, nonce, prepay_id);
        self.sign(&message)
    }
}

/// Verifier holding the gateway platform public key, used on inbound
/// callbacks.
#[derive(Clone, Debug)]
pub struct GatewayVerifier {
    verifying_key: VerifyingKey<Sha256>,
}

impl GatewayVerifier {
    pub fn from_pem(public_key_pem: &str) -> Result<Self, ServiceError> {
        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|e| {
            ServiceError::GatewayConfigInvalid(format!("gateway public key: {}", e))
        })?;

        Ok(Self {
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
        })
    }

    pub fn from_public_key(public_key: RsaPublicKey) -> Self {
        Self {
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
        }
    }

    /// Verifies a base64 signature over the canonical callback message.
    /// Failures are trust errors; callers must not touch any state after one.
    pub fn verify(&self, message: &str, signature_b64: &str) -> Result<(), ServiceError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| ServiceError::Forbidden("malformed callback signature".to_string()))?;
        let signature = Signature::try_from(raw.as_slice())
            .map_err(|_| ServiceError::Forbidden("malformed callback signature".to_string()))?;

        self.verifying_key
            .verify(message.as_bytes(), &signature)
            .map_err(|_| ServiceError::Forbidden("callback signature mismatch".to_string()))
    }
}

/// Canonical message a callback signature covers.
pub fn callback_message(timestamp: &str, nonce: &str, body: &str) -> String {
    format!("{}\n{}\n{}\n", timestamp, nonce, body)
}
