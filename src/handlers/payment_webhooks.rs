use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde_json::json;
use tracing::info;

use crate::errors::ServiceError;
use crate::services::reconciliation::ReconcileOutcome;
use crate::AppState;

// POST /api/v1/payments/notify
//
// The gateway retries on any non-2xx, so every processed notification acks
// with 200 even when it was a duplicate or referenced an unknown trade
// number. Only trust failures (bad signature, undecryptable resource) and
// infrastructure errors are non-2xx; a forged callback never reaches the
// order store.
#[utoipa::path(
    post,
    path = "/api/v1/payments/notify",
    request_body = String,
    responses(
        (status = 200, description = "Notification processed"),
        (status = 403, description = "Signature verification failed", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    // Authenticity first; nothing in the payload is trusted before this.
    let notification = state.gateway.verify_and_decrypt_callback(&headers, &body)?;

    let outcome = state
        .reconciliation
        .apply_payment_result(&notification)
        .await?;

    if outcome == ReconcileOutcome::UnknownTradeNo {
        info!(trade_no = %notification.trade_no, "acknowledging notification for unknown trade number");
    }

    Ok(Json(json!({ "code": "SUCCESS", "message": "ok" })))
}
