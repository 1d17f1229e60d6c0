use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One payment attempt. Rows are never deleted; the status column records
/// where the attempt ended up.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    /// Line-item snapshot captured at initiation, serialized `Vec<LineItem>`.
    /// Immutable once written.
    #[sea_orm(column_type = "Json")]
    pub items: Json,
    pub total_amount: Decimal,
    pub tax_amount: Option<Decimal>,
    pub shipping_cost: Option<Decimal>,
    pub payment_method: String,
    pub card_last_four: Option<String>,
    pub card_network: Option<String>,
    #[sea_orm(unique)]
    pub transaction_id: Option<String>,
    #[sea_orm(unique)]
    pub payment_token: Option<String>,
    pub status: PaymentStatus,
    pub status_message: String,
    pub shipping_address: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_country: Option<String>,
    pub shipping_postal_code: Option<String>,
    pub shipping_phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Deserializes the line-item snapshot.
    pub fn line_items(&self) -> Result<Vec<LineItem>, serde_json::Error> {
        serde_json::from_value(self.items.clone())
    }
}

/// Payment status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl PaymentStatus {
    /// A terminal payment admits no further transition. `Completed` is the
    /// one non-pending status that still has an outgoing edge (to
    /// `Refunded`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded | Self::Cancelled)
    }
}

/// One purchased line in a payment's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
}
