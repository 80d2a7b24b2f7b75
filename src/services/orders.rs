use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::order::{
    self, AutoCancelStatus, Entity as OrderEntity, Model as OrderModel, OrderStatus,
    PAY_STATUS_UNPAID,
};
use crate::entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel};
use crate::entities::product::Entity as ProductEntity;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{release_stock, reserve_stock};

const ORDER_NO_ATTEMPTS: usize = 5;

/// Request/response types for the order workflow
#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<PlaceOrderItem>,

    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub receiver_name: String,

    #[validate(length(min = 1, message = "Recipient phone is required"))]
    pub receiver_phone: String,

    #[validate(length(min = 1, message = "Recipient address is required"))]
    pub receiver_address: String,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct PlaceOrderItem {
    pub product_id: Uuid,

    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub name: String,
    pub image_url: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_no: String,
    pub status: String,
    pub pay_status: i16,
    pub total_price: Decimal,
    pub currency: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub receiver_address: String,
    pub trade_no: Option<String>,
    pub transaction_id: Option<String>,
    pub success_time: Option<DateTime<Utc>>,
    pub cancel_pay_time: Option<DateTime<Utc>>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Detects backend conflict/serialization failures so callers can retry the
/// whole placement once, as distinct from plain database errors.
fn map_txn_err(e: sea_orm::DbErr) -> ServiceError {
    let text = e.to_string().to_ascii_lowercase();
    if text.contains("deadlock") || text.contains("serial") || text.contains("database is locked") {
        ServiceError::Conflict("transaction conflict, retry the operation".to_string())
    } else {
        ServiceError::DatabaseError(e)
    }
}

/// Claims a status transition on an order with a guard on its current
/// status (and, for departures from `pending`, the unpaid flag). Zero rows
/// affected means a concurrent actor won the race.
pub(crate) async fn claim_transition<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    auto_cancel: Option<AutoCancelStatus>,
) -> Result<bool, ServiceError> {
    let mut update = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(to.to_string()))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        )
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(from.to_string()));

    if let Some(auto_cancel) = auto_cancel {
        update = update.col_expr(
            order::Column::AutoCancelStatus,
            Expr::value(auto_cancel.to_string()),
        );
    }
    if from == OrderStatus::Pending {
        update = update.filter(order::Column::PayStatus.eq(PAY_STATUS_UNPAID));
    }

    let result = update.exec(conn).await?;
    Ok(result.rows_affected > 0)
}

/// Leaves `pending` while handing every reserved unit back to the ledger.
///
/// Shared by buyer cancellation, the auto-cancel sweep and the failed-payment
/// path so the three can never diverge on release bookkeeping. Must run
/// inside a transaction: the claim, the ledger releases and the snapshot
/// zeroing commit or roll back together.
pub(crate) async fn release_and_leave_pending<C: ConnectionTrait>(
    txn: &C,
    order_id: Uuid,
    to: OrderStatus,
) -> Result<(), ServiceError> {
    let claimed = claim_transition(
        txn,
        order_id,
        OrderStatus::Pending,
        to,
        Some(AutoCancelStatus::Cancelled),
    )
    .await?;
    if !claimed {
        return Err(ServiceError::InvalidTransition(format!(
            "order {} is no longer pending",
            order_id
        )));
    }

    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(txn)
        .await?;

    for item in items {
        if item.locked_quantity == 0 {
            continue;
        }
        // Release exactly what this order recorded, not a re-derivation
        // from current catalog data.
        release_stock(txn, item.product_id, item.locked_quantity).await?;

        OrderItemEntity::update_many()
            .col_expr(order_item::Column::LockedQuantity, Expr::value(0))
            .filter(order_item::Column::Id.eq(item.id))
            .exec(txn)
            .await?;
    }

    Ok(())
}

/// Service owning the order lifecycle workflow.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    currency: String,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, currency: String) -> Self {
        Self {
            db,
            event_sender,
            currency,
        }
    }

    async fn send_event(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to send order event");
        }
    }

    /// Places an order: validates stock, reserves it and writes the order
    /// and its denormalized items in one transaction. No partial
    /// reservation survives a failure anywhere in the block.
    #[instrument(skip(self, request), fields(buyer_id = %buyer_id))]
    pub async fn place_order(
        &self,
        buyer_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }

        let db = &*self.db;

        // Fail fast before touching the ledger: every line must be
        // satisfiable from current availability.
        let mut products = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = ProductEntity::find_by_id(item.product_id)
                .one(db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;
            if product.available() < item.quantity {
                return Err(ServiceError::OutOfStock(format!(
                    "product {} ({}) has {} unit(s) available, {} requested",
                    product.id,
                    product.name,
                    product.available(),
                    item.quantity
                )));
            }
            products.push(product);
        }

        let total_price: Decimal = request
            .items
            .iter()
            .zip(&products)
            .map(|(item, product)| product.price * Decimal::from(item.quantity))
            .sum();

        let order_no = self.generate_order_no().await?;
        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let txn = db.begin().await.map_err(map_txn_err)?;

        // Reserve every line under the availability guard; the loser of a
        // concurrent race rolls the whole placement back.
        for item in &request.items {
            reserve_stock(&txn, item.product_id, item.quantity).await?;
        }

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_no: Set(order_no.clone()),
            buyer_id: Set(buyer_id),
            status: Set(OrderStatus::Pending.to_string()),
            pay_status: Set(PAY_STATUS_UNPAID),
            total_price: Set(total_price),
            currency: Set(self.currency.clone()),
            receiver_name: Set(request.receiver_name.clone()),
            receiver_phone: Set(request.receiver_phone.clone()),
            receiver_address: Set(request.receiver_address.clone()),
            trade_no: Set(None),
            transaction_id: Set(None),
            success_time: Set(None),
            cancel_pay_time: Set(None),
            auto_cancel_status: Set(AutoCancelStatus::Pending.to_string()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };
        let order_model = order_model.insert(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "failed to insert order");
            map_txn_err(e)
        })?;

        let mut item_models = Vec::with_capacity(request.items.len());
        for (item, product) in request.items.iter().zip(&products) {
            let item_model = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                quantity: Set(item.quantity),
                unit_price: Set(product.price),
                name: Set(product.name.clone()),
                image_url: Set(product.image_url.clone()),
                locked_quantity: Set(item.quantity),
                created_at: Set(now),
            };
            item_models.push(item_model.insert(&txn).await.map_err(map_txn_err)?);
        }

        txn.commit().await.map_err(map_txn_err)?;

        info!(order_id = %order_id, order_no = %order_no, "order placed");
        self.send_event(Event::OrderCreated(order_id)).await;

        Ok(Self::to_response(order_model, item_models))
    }

    /// Buyer-initiated cancellation. Only a `pending` order cancels; the
    /// reservation is handed back atomically with the transition.
    #[instrument(skip(self), fields(order_id = %order_id, buyer_id = %buyer_id))]
    pub async fn cancel_order(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let order = self.load_owned_order(buyer_id, order_id).await?;

        let txn = db.begin().await.map_err(map_txn_err)?;
        release_and_leave_pending(&txn, order.id, OrderStatus::Cancelled).await?;
        txn.commit().await.map_err(map_txn_err)?;

        info!(order_id = %order_id, "order cancelled by buyer");
        self.send_event(Event::OrderCancelled(order_id)).await;

        self.fetch_response(order_id).await
    }

    /// `shipped -> completed`. No inventory side effects; stock was
    /// permanently decremented at shipment by fulfillment.
    #[instrument(skip(self), fields(order_id = %order_id, buyer_id = %buyer_id))]
    pub async fn confirm_receipt(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.load_owned_order(buyer_id, order_id).await?;

        let claimed = claim_transition(
            &*self.db,
            order.id,
            OrderStatus::Shipped,
            OrderStatus::Completed,
            None,
        )
        .await?;
        if !claimed {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is not shipped",
                order_id
            )));
        }

        self.send_event(Event::OrderCompleted(order_id)).await;
        self.fetch_response(order_id).await
    }

    /// `paid|shipped -> refunding`.
    #[instrument(skip(self), fields(order_id = %order_id, buyer_id = %buyer_id))]
    pub async fn request_refund(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.load_owned_order(buyer_id, order_id).await?;
        let current = order
            .status()
            .map_err(|_| ServiceError::InternalError(format!("bad status on {}", order_id)))?;

        if !current.can_transition_to(OrderStatus::Refunding) {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} in status {} cannot request a refund",
                order_id, current
            )));
        }

        let claimed =
            claim_transition(&*self.db, order.id, current, OrderStatus::Refunding, None).await?;
        if !claimed {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} changed status concurrently",
                order_id
            )));
        }

        self.send_event(Event::OrderRefundRequested(order_id)).await;
        self.fetch_response(order_id).await
    }

    /// Collaborator-facing transitions: shipment (`paid -> shipped`) and
    /// refund settlement (`refunding -> refunded`). Everything else moves
    /// through its dedicated operation.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let current = order
            .status()
            .map_err(|_| ServiceError::InternalError(format!("bad status on {}", order_id)))?;

        let allowed = matches!(
            (current, new_status),
            (OrderStatus::Paid, OrderStatus::Shipped)
                | (OrderStatus::Refunding, OrderStatus::Refunded)
        );
        if !allowed {
            return Err(ServiceError::InvalidTransition(format!(
                "cannot move order {} from {} to {}",
                order_id, current, new_status
            )));
        }

        let claimed = claim_transition(&*self.db, order_id, current, new_status, None).await?;
        if !claimed {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} changed status concurrently",
                order_id
            )));
        }

        let event = match new_status {
            OrderStatus::Shipped => Event::OrderShipped(order_id),
            _ => Event::OrderRefunded(order_id),
        };
        self.send_event(event).await;

        self.fetch_response(order_id).await
    }

    #[instrument(skip(self), fields(order_id = %order_id, buyer_id = %buyer_id))]
    pub async fn get_order(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        self.load_owned_order(buyer_id, order_id).await?;
        self.fetch_response(order_id).await
    }

    /// Buyer's orders, newest first.
    #[instrument(skip(self), fields(buyer_id = %buyer_id))]
    pub async fn list_orders(
        &self,
        buyer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let paginator = OrderEntity::find()
            .filter(order::Column::BuyerId.eq(buyer_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order in orders {
            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order.id))
                .all(&*self.db)
                .await?;
            responses.push(Self::to_response(order, items));
        }

        Ok(OrderListResponse {
            orders: responses,
            total,
            page,
            per_page,
        })
    }

    pub(crate) async fn load_owned_order(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.buyer_id != buyer_id {
            return Err(ServiceError::Forbidden(format!(
                "order {} belongs to another buyer",
                order_id
            )));
        }
        Ok(order)
    }

    async fn fetch_response(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(Self::to_response(order, items))
    }

    /// Business-visible order number: timestamp plus a random suffix,
    /// re-rolled on the unlikely collision.
    async fn generate_order_no(&self) -> Result<String, ServiceError> {
        for _ in 0..ORDER_NO_ATTEMPTS {
            let candidate = format!(
                "{}{:06}",
                Utc::now().format("%Y%m%d%H%M%S%3f"),
                rand::thread_rng().gen_range(0..1_000_000)
            );
            let exists = OrderEntity::find()
                .filter(order::Column::OrderNo.eq(candidate.clone()))
                .count(&*self.db)
                .await?
                > 0;
            if !exists {
                return Ok(candidate);
            }
        }
        Err(ServiceError::Conflict(
            "could not generate a unique order number".to_string(),
        ))
    }

    fn to_response(order: OrderModel, items: Vec<OrderItemModel>) -> OrderResponse {
        OrderResponse {
            id: order.id,
            order_no: order.order_no,
            status: order.status,
            pay_status: order.pay_status,
            total_price: order.total_price,
            currency: order.currency,
            receiver_name: order.receiver_name,
            receiver_phone: order.receiver_phone,
            receiver_address: order.receiver_address,
            trade_no: order.trade_no,
            transaction_id: order.transaction_id,
            success_time: order.success_time,
            cancel_pay_time: order.cancel_pay_time,
            items: items
                .into_iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id,
                    name: item.name,
                    image_url: item.image_url,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}
