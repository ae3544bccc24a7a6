use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inventory - per-product stock owned by the Inventory service.
///
/// `amount` is never negative in any committed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    #[serde(rename = "product_id")]
    pub product_id: i64,
    /// Price per unit, used to cost a reservation
    #[serde(rename = "unit_price")]
    pub unit_price: i32,
    /// Units currently in stock
    pub amount: i32,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

/// Idempotency ledger row for the Inventory service.
///
/// Inserted in the same transaction as the prepare step. `reserved` is set
/// only when stock was actually deducted, so compensation can tell a real
/// reservation from an OUT_OF_STOCK echo; restoring clears it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedOrder {
    pub order_id: i64,
    pub product_id: i64,
    pub amount: i32,
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
}
