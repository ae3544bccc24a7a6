use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account - per-customer balance owned by the Payment service.
///
/// `balance` is never negative in any committed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    pub balance: i64,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

/// Idempotency ledger row for the Payment service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedOrder {
    pub order_id: i64,
    pub created_at: DateTime<Utc>,
}
