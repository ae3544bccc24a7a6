use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an order.
///
/// `Pending` is the initial state; `Prepared` is internal to the saga.
/// `Billed`, `OutOfStock` and `ExceedCreditLimit` are terminal and a
/// committed order never leaves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Prepared,
    OutOfStock,
    Billed,
    ExceedCreditLimit,
}

impl OrderStatus {
    /// Wire and column spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Prepared => "PREPARED",
            OrderStatus::OutOfStock => "OUT_OF_STOCK",
            OrderStatus::Billed => "BILLED",
            OrderStatus::ExceedCreditLimit => "EXCEED_CREDIT_LIMIT",
        }
    }

    /// Terminal statuses are immutable once committed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Billed | OrderStatus::OutOfStock | OrderStatus::ExceedCreditLimit
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status column holds an unrecognized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PREPARED" => Ok(OrderStatus::Prepared),
            "OUT_OF_STOCK" => Ok(OrderStatus::OutOfStock),
            "BILLED" => Ok(OrderStatus::Billed),
            "EXCEED_CREDIT_LIMIT" => Ok(OrderStatus::ExceedCreditLimit),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Order - a customer's purchase of one product, owned by the Order service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    /// Monotonic identifier assigned by the store
    pub id: i64,
    /// Customer placing the order
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    /// Product being ordered
    #[serde(rename = "product_id")]
    pub product_id: i64,
    /// Number of units ordered (positive)
    pub amount: i32,
    /// Current saga status
    pub status: OrderStatus,
    /// Creation timestamp
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    #[serde(rename = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an order; the store assigns id, status and timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOrder {
    pub customer_id: i64,
    pub product_id: i64,
    pub amount: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_column_spelling() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Prepared,
            OrderStatus::OutOfStock,
            OrderStatus::Billed,
            OrderStatus::ExceedCreditLimit,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("CANCELLED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Prepared.is_terminal());
        assert!(OrderStatus::Billed.is_terminal());
        assert!(OrderStatus::OutOfStock.is_terminal());
        assert!(OrderStatus::ExceedCreditLimit.is_terminal());
    }
}
