use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Request-scoped buyer identity.
///
/// The identity collaborator authenticates the caller upstream and forwards
/// the opaque buyer id in `x-buyer-id`; this service trusts it as given and
/// threads it explicitly through every operation instead of reading ambient
/// session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuyerContext {
    pub buyer_id: Uuid,
}

impl BuyerContext {
    pub fn new(buyer_id: Uuid) -> Self {
        Self { buyer_id }
    }
}

const BUYER_HEADER: &str = "x-buyer-id";

#[axum::async_trait]
impl<S> FromRequestParts<S> for BuyerContext
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(BUYER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Forbidden("missing buyer identity".to_string()))?;

        let buyer_id = Uuid::parse_str(raw)
            .map_err(|_| ServiceError::Forbidden("malformed buyer identity".to_string()))?;

        Ok(BuyerContext { buyer_id })
    }
}
