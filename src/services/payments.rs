use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::{self, Entity as OrderEntity, OrderStatus, PAY_STATUS_UNPAID};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{ClientPayPackage, TransactionGateway};

const TRADE_NO_ATTEMPTS: usize = 5;

/// Everything the client needs to bring up the native payment sheet.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentIntentResponse {
    pub order_id: Uuid,
    pub order_no: String,
    pub trade_no: String,
    pub pay_package: ClientPayPackage,
}

/// Creates payment intents against the external gateway and records the
/// pending payment snapshot on the order.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn TransactionGateway>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn TransactionGateway>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
        }
    }

    /// Creates (or refreshes) the payment intent for a pending order and
    /// returns the signed client package. Marks nothing as paid; that is
    /// reconciliation's job.
    #[instrument(skip(self), fields(order_id = %order_id, buyer_id = %buyer_id))]
    pub async fn create_payment_intent(
        &self,
        buyer_id: Uuid,
        order_id: Uuid,
    ) -> Result<PaymentIntentResponse, ServiceError> {
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
        if order.is_paid() {
            return Err(ServiceError::AlreadyPaid(format!(
                "order {} has already been paid",
                order.order_no
            )));
        }
        let status = order
            .status()
            .map_err(|_| ServiceError::InternalError(format!("bad status on {}", order_id)))?;
        if status != OrderStatus::Pending {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} in status {} cannot start a payment",
                order_id, status
            )));
        }

        let amount_total = minor_units(order.total_price)?;
        let trade_no = self.resolve_trade_no(&order).await?;
        let description = format!("order {}", order.order_no);

        let prepay_id = self
            .gateway
            .create_transaction(&trade_no, &description, amount_total)
            .await?;
        let pay_package = self.gateway.client_pay_package(&prepay_id)?;

        // Open (or refresh) the payment window together with the trade
        // number; guarded so a concurrently resolved order is not revived.
        let result = OrderEntity::update_many()
            .col_expr(order::Column::TradeNo, Expr::value(trade_no.clone()))
            .col_expr(order::Column::CancelPayTime, Expr::value(Utc::now()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_string()))
            .filter(order::Column::PayStatus.eq(PAY_STATUS_UNPAID))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(order_id = %order_id, "order resolved while creating payment intent");
            return Err(ServiceError::InvalidTransition(format!(
                "order {} was resolved while the payment intent was being created",
                order_id
            )));
        }

        info!(order_id = %order_id, trade_no = %trade_no, "payment intent created");
        if let Err(e) = self
            .event_sender
            .send(Event::PaymentIntentCreated {
                order_id,
                trade_no: trade_no.clone(),
            })
            .await
        {
            warn!(error = %e, "failed to send payment intent event");
        }

        Ok(PaymentIntentResponse {
            order_id,
            order_no: order.order_no,
            trade_no,
            pay_package,
        })
    }

    /// Picks the trade number for this attempt. The order number is the
    /// natural choice; if some other order already claimed it (or a
    /// previous suffixed attempt), a fresh suffixed number is generated.
    async fn resolve_trade_no(&self, order: &order::Model) -> Result<String, ServiceError> {
        if let Some(existing) = &order.trade_no {
            return Ok(existing.clone());
        }

        let mut candidate = order.order_no.clone();
        for _ in 0..TRADE_NO_ATTEMPTS {
            let taken = OrderEntity::find()
                .filter(order::Column::TradeNo.eq(candidate.clone()))
                .filter(order::Column::Id.ne(order.id))
                .count(&*self.db)
                .await?
                > 0;
            if !taken {
                return Ok(candidate);
            }
            candidate = format!(
                "{}{:04}",
                order.order_no,
                rand::thread_rng().gen_range(0..10_000)
            );
        }

        Err(ServiceError::Conflict(
            "could not generate a unique trade number".to_string(),
        ))
    }
}

/// Converts the order total to the gateway's minor currency unit.
fn minor_units(total: Decimal) -> Result<i64, ServiceError> {
    let minor = (total * Decimal::from(100)).round();
    let amount = minor
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("order total out of range".to_string()))?;
    if amount <= 0 {
        return Err(ServiceError::ValidationError(
            "payment amount must be positive".to_string(),
        ));
    }
    Ok(amount)
}
