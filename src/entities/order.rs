use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Order lifecycle states.
///
/// `cancelled` and `payment_fail` are terminal for the payment path; a new
/// order must be placed to retry. Transitions are guarded everywhere through
/// [`OrderStatus::can_transition_to`].
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, ToSchema,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    PaymentFail,
    Shipped,
    Completed,
    Refunding,
    Refunded,
}

impl OrderStatus {
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Pending, PaymentFail)
                | (Paid, Shipped)
                | (Paid, Refunding)
                | (Shipped, Completed)
                | (Shipped, Refunding)
                | (Refunding, Refunded)
        )
    }
}

/// Auto-cancellation bookkeeping states.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AutoCancelStatus {
    Pending,
    Cancelled,
    Paid,
}

/// Pay-status flag carried on the order row. 0 = unpaid, 1 = paid.
pub const PAY_STATUS_UNPAID: i16 = 0;
pub const PAY_STATUS_PAID: i16 = 1;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Business-visible order number, distinct from the storage id
    #[validate(length(
        min = 1,
        max = 50,
        message = "Order number must be between 1 and 50 characters"
    ))]
    pub order_no: String,

    pub buyer_id: Uuid,
    pub status: String,

    /// 0 = unpaid, 1 = paid
    pub pay_status: i16,

    pub total_price: Decimal,
    pub currency: String,

    /// Shipping address snapshot, denormalized at placement
    pub receiver_name: String,
    pub receiver_phone: String,
    pub receiver_address: String,

    /// External trade number; the only identifier the gateway knows
    pub trade_no: Option<String>,
    /// Gateway transaction id, set exactly once by reconciliation
    pub transaction_id: Option<String>,
    /// Payment success timestamp reported by the gateway
    pub success_time: Option<DateTime<Utc>>,

    /// When the payment window opened; null until a payment intent exists
    pub cancel_pay_time: Option<DateTime<Utc>>,
    pub auto_cancel_status: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl Model {
    pub fn status(&self) -> Result<OrderStatus, strum::ParseError> {
        self.status.parse()
    }

    pub fn is_paid(&self) -> bool {
        self.pay_status == PAY_STATUS_PAID
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
