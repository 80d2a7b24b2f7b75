use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use crate::context::BuyerContext;
use crate::errors::ServiceError;
use crate::services::payments::PaymentIntentResponse;
use crate::{ApiResponse, AppState};

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/pay",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment intent created; client package returned", body = PaymentIntentResponse),
        (status = 409, description = "Order already paid or resolved", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway rejected the transaction", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentIntentResponse>>, ServiceError> {
    let intent = state
        .payments
        .create_payment_intent(buyer.buyer_id, id)
        .await?;
    Ok(Json(ApiResponse::success(intent)))
}
