//! Stock primitives over the product catalog.
//!
//! The payment core reserves inventory only through
//! [`decrement_stock_if_available`]: one conditional UPDATE that both checks
//! and subtracts. Callers decide what a zero-row result means; the functions
//! here never read the counter first.

use crate::entities::product;
use crate::errors::ServiceError;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::instrument;

/// Decrements a product's stock by `quantity` only if at least that much is
/// on hand, in a single statement:
///
/// ```sql
/// UPDATE products SET stock = stock - ? WHERE id = ? AND stock >= ?
/// ```
///
/// Returns the number of rows affected (0 or 1). Zero means the product does
/// not exist or has insufficient stock. Generic over the connection so a
/// caller's transaction can carry the update.
#[instrument(skip(conn))]
pub async fn decrement_stock_if_available<C>(
    conn: &C,
    product_id: i64,
    quantity: i32,
) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
{
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Decrement quantity must be positive, got {}",
            quantity
        )));
    }

    let result = product::Entity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    Ok(result.rows_affected)
}

/// Current stock counter for a product.
#[instrument(skip(conn))]
pub async fn stock_on_hand<C>(conn: &C, product_id: i64) -> Result<i32, ServiceError>
where
    C: ConnectionTrait,
{
    let found = product::Entity::find_by_id(product_id).one(conn).await?;

    found
        .map(|p| p.stock)
        .ok_or_else(|| ServiceError::NotFound(format!("Product not found with id: {}", product_id)))
}
