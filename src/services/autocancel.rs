use chrono::{Duration, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SweepConfig;
use crate::entities::order::{self, AutoCancelStatus, Entity as OrderEntity, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::orders::release_and_leave_pending;

/// Counters reported by one sweep run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepOutcome {
    /// Orders whose reservation was released and status set to cancelled
    pub cancelled: u64,
    /// Orders that resolved concurrently between scan and claim
    pub skipped: u64,
    /// Orders whose per-order transaction failed; logged, not thrown
    pub failed: u64,
}

/// Reclaims reservations from orders stuck in the payment window.
///
/// Both the scheduled batch sweep and the client-countdown single-order
/// trigger run through the same release-and-cancel transaction.
#[derive(Clone)]
pub struct AutoCancelService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    payment_window: Duration,
}

impl AutoCancelService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, cfg: &SweepConfig) -> Self {
        Self {
            db,
            event_sender,
            payment_window: Duration::seconds(cfg.payment_window_secs as i64),
        }
    }

    /// Cancels up to `batch_limit` orders whose payment window expired.
    ///
    /// Each order gets its own transaction; one failure never aborts the
    /// rest of the sweep.
    #[instrument(skip(self))]
    pub async fn sweep_expired_orders(
        &self,
        batch_limit: u64,
    ) -> Result<SweepOutcome, ServiceError> {
        let deadline = Utc::now() - self.payment_window;

        let expired = OrderEntity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_string()))
            .filter(order::Column::AutoCancelStatus.eq(AutoCancelStatus::Pending.to_string()))
            .filter(order::Column::CancelPayTime.is_not_null())
            .filter(order::Column::CancelPayTime.lte(deadline))
            .order_by_asc(order::Column::CancelPayTime)
            .limit(batch_limit)
            .all(&*self.db)
            .await?;

        let mut outcome = SweepOutcome::default();
        for order in expired {
            match self.release_and_cancel(order.id).await {
                Ok(()) => outcome.cancelled += 1,
                Err(ServiceError::InvalidTransition(_)) => {
                    // Payment or buyer cancellation won the race; nothing
                    // left to reclaim.
                    outcome.skipped += 1;
                }
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "auto-cancel failed for order");
                    outcome.failed += 1;
                }
            }
        }

        if outcome.cancelled > 0 || outcome.failed > 0 {
            info!(
                cancelled = outcome.cancelled,
                skipped = outcome.skipped,
                failed = outcome.failed,
                "auto-cancel sweep finished"
            );
        }
        Ok(outcome)
    }

    /// Single-order trigger for client-side countdowns. Re-checks the
    /// deadline, then reuses the identical release-and-cancel transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_expired(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let deadline = Utc::now() - self.payment_window;
        match order.cancel_pay_time {
            Some(opened) if opened <= deadline => {}
            _ => {
                return Err(ServiceError::InvalidTransition(format!(
                    "payment window for order {} has not expired",
                    order_id
                )));
            }
        }

        self.release_and_cancel(order_id).await
    }

    async fn release_and_cancel(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        match release_and_leave_pending(&txn, order_id, OrderStatus::Cancelled).await {
            Ok(()) => {
                txn.commit().await?;
                info!(order_id = %order_id, "order auto-cancelled, reservation released");
                if let Err(e) = self
                    .event_sender
                    .send(Event::OrderAutoCancelled(order_id))
                    .await
                {
                    warn!(error = %e, "failed to send auto-cancel event");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, order_id = %order_id, "rollback failed during auto-cancel");
                }
                Err(e)
            }
        }
    }
}

/// Starts the fixed-interval sweep loop. Runs until process shutdown.
pub fn spawn_sweeper(service: AutoCancelService, cfg: &SweepConfig) {
    let interval_secs = cfg.interval_secs;
    let batch_limit = cfg.batch_limit;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // First tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_expired_orders(batch_limit).await {
                error!(error = %e, "auto-cancel sweep errored");
            }
        }
    });
}
