use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::context::BuyerContext;
use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;
use crate::services::orders::{OrderListResponse, OrderResponse, PlaceOrderRequest};
use crate::{ApiResponse, AppState, ListQuery};

/// Collaborator transition request (shipment, refund settlement).
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = PlaceOrderRequest,
    responses(
        (status = 201, description = "Order placed"),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn place_order(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.place_order(buyer.buyer_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    responses((status = 200, description = "Buyer's orders")),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<OrderListResponse>>, ServiceError> {
    let orders = state
        .orders
        .list_orders(buyer.buyer_id, query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order detail"),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.orders.get_order(buyer.buyer_id, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled, reservation released"),
        (status = 409, description = "Order not cancellable", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.orders.cancel_order(buyer.buyer_id, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/receipt",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Receipt confirmed"),
        (status = 409, description = "Order not shipped", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn confirm_receipt(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.orders.confirm_receipt(buyer.buyer_id, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Refund requested"),
        (status = 409, description = "Order not refundable", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn request_refund(
    State(state): State<AppState>,
    buyer: BuyerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.orders.request_refund(buyer.buyer_id, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated"),
        (status = 409, description = "Transition rejected", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.orders.update_status(id, request.status).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/expire",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Expired order cancelled"),
        (status = 409, description = "Window still open or order resolved", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn expire_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<&'static str>>, ServiceError> {
    state.autocancel.cancel_expired(id).await?;
    Ok(Json(ApiResponse::success("cancelled")))
}
