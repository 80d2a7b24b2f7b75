use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;

/// Atomically reserves `quantity` units of a product by bumping its locked
/// counter, guarded by availability: the update only applies while
/// `stock - locked_stock >= quantity`, so a lost race surfaces as zero rows
/// affected instead of oversold stock.
///
/// Runs on the caller's transaction. Locked stock never moves outside a
/// transaction that also moves the owning order's status.
pub async fn reserve_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    debug_assert!(quantity > 0);

    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::LockedStock,
            Expr::col(product::Column::LockedStock).add(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(
            Expr::col(product::Column::LockedStock)
                .lte(Expr::col(product::Column::Stock).sub(quantity)),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::OutOfStock(format!(
            "product {} has insufficient available stock for {} unit(s)",
            product_id, quantity
        )));
    }
    Ok(())
}

/// Releases `quantity` previously reserved units, floored at zero by the
/// guard so a stray double-release can never drive the counter negative.
pub async fn release_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    if quantity == 0 {
        return Ok(());
    }

    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::LockedStock,
            Expr::col(product::Column::LockedStock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(Expr::col(product::Column::LockedStock).gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::Conflict(format!(
            "product {} holds fewer than {} locked unit(s); release refused",
            product_id, quantity
        )));
    }
    Ok(())
}
