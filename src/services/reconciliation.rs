use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::entities::order::{
    self, AutoCancelStatus, Entity as OrderEntity, OrderStatus, PAY_STATUS_PAID, PAY_STATUS_UNPAID,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::PaymentNotification;
use crate::services::orders::release_and_leave_pending;

/// What a verified notification did to the order store. Every variant is a
/// success towards the gateway; only infrastructure failures bubble up as
/// errors (and a non-2xx, so the gateway retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Payment applied: order moved to `paid`
    Applied,
    /// Failure notification applied: order moved to `payment_fail`
    FailureApplied,
    /// The order was already resolved; re-delivery or race loser, no-op
    AlreadyResolved,
    /// No order carries this trade number; logged as an anomaly
    UnknownTradeNo,
}

/// Applies verified gateway notifications to the order store.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ReconciliationService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Idempotently applies a payment result.
    ///
    /// The caller must have verified the notification's authenticity; this
    /// service trusts its input. Lookup is by trade number, the only key
    /// the gateway knows. Re-delivery of a processed notification is a
    /// logged no-op; the first delivery's transaction id and success time
    /// are never overwritten.
    #[instrument(skip(self, notification), fields(trade_no = %notification.trade_no))]
    pub async fn apply_payment_result(
        &self,
        notification: &PaymentNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::TradeNo.eq(notification.trade_no.clone()))
            .one(&*self.db)
            .await?;

        let Some(order) = order else {
            warn!(
                trade_no = %notification.trade_no,
                transaction_id = %notification.transaction_id,
                "payment notification for unknown trade number"
            );
            return Ok(ReconcileOutcome::UnknownTradeNo);
        };

        if notification.trade_state.is_success() {
            self.apply_success(&order, notification).await
        } else {
            self.apply_failure(&order, notification).await
        }
    }

    async fn apply_success(
        &self,
        order: &order::Model,
        notification: &PaymentNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let success_time = notification.success_time.unwrap_or_else(Utc::now);

        // Single guarded statement: the transition, the paid flag and the
        // linkage fields land together, and only while the order is still
        // pending and unpaid. The guard is the idempotency mechanism.
        let result = OrderEntity::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Paid.to_string()),
            )
            .col_expr(order::Column::PayStatus, Expr::value(PAY_STATUS_PAID))
            .col_expr(
                order::Column::AutoCancelStatus,
                Expr::value(AutoCancelStatus::Paid.to_string()),
            )
            .col_expr(
                order::Column::TransactionId,
                Expr::value(notification.transaction_id.clone()),
            )
            .col_expr(order::Column::SuccessTime, Expr::value(success_time))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_string()))
            .filter(order::Column::PayStatus.eq(PAY_STATUS_UNPAID))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            if order.is_paid() {
                info!(order_id = %order.id, "duplicate payment notification ignored");
            } else {
                // Paid money arrived for an order something else resolved
                // first (cancelled or failed). Needs a human.
                warn!(
                    order_id = %order.id,
                    status = %order.status,
                    transaction_id = %notification.transaction_id,
                    "payment succeeded for an already-resolved order; manual reconciliation required"
                );
            }
            return Ok(ReconcileOutcome::AlreadyResolved);
        }

        info!(order_id = %order.id, transaction_id = %notification.transaction_id, "order paid");
        if let Err(e) = self.event_sender.send(Event::OrderPaid(order.id)).await {
            warn!(error = %e, "failed to send order paid event");
        }
        Ok(ReconcileOutcome::Applied)
    }

    /// A verified failure releases the reservation together with the
    /// `pending -> payment_fail` transition so no locked stock can orphan
    /// on a dead payment.
    async fn apply_failure(
        &self,
        order: &order::Model,
        notification: &PaymentNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        match release_and_leave_pending(&txn, order.id, OrderStatus::PaymentFail).await {
            Ok(()) => {
                txn.commit().await?;
                info!(
                    order_id = %order.id,
                    trade_no = %notification.trade_no,
                    "payment failed; reservation released"
                );
                if let Err(e) = self
                    .event_sender
                    .send(Event::OrderPaymentFailed(order.id))
                    .await
                {
                    warn!(error = %e, "failed to send payment failed event");
                }
                Ok(ReconcileOutcome::FailureApplied)
            }
            Err(ServiceError::InvalidTransition(_)) => {
                txn.rollback().await?;
                info!(order_id = %order.id, "failure notification for resolved order ignored");
                Ok(ReconcileOutcome::AlreadyResolved)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    // A failed rollback leaves counters and status possibly
                    // diverged; that is an operational anomaly, not a crash.
                    warn!(error = %rollback_err, order_id = %order.id, "rollback failed after release error");
                }
                Err(e)
            }
        }
    }
}
