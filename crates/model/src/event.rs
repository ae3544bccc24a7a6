//! Wire payloads for the three broker topics. All events are JSON with
//! lowercase snake_case field names; statuses use their column spelling.

use serde::{Deserialize, Serialize};

use crate::order::OrderStatus;

/// Published on `ORDER_CREATED` by the Order service once an order row is
/// committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedOrderEvent {
    #[serde(rename = "order_id")]
    pub order_id: i64,
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    #[serde(rename = "product_id")]
    pub product_id: i64,
    pub amount: i32,
}

/// Published on `PREPARED_INVENTORY` by the Inventory service; `status` is
/// either `PREPARED` (with the reservation's `cost`) or `OUT_OF_STOCK`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreparedInventoryEvent {
    #[serde(rename = "order_id")]
    pub order_id: i64,
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    #[serde(rename = "product_id")]
    pub product_id: i64,
    pub amount: i32,
    pub cost: i32,
    pub status: OrderStatus,
}

/// Published on `ORDER_BILL` by the Payment service with the saga's terminal
/// status. Consumed by the Order service (final status) and by the Inventory
/// service (compensation for non-BILLED outcomes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillEvent {
    #[serde(rename = "order_id")]
    pub order_id: i64,
    pub amount: i32,
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_created_order_event() {
        let json = r#"{"order_id": 7, "customer_id": 1, "product_id": 2, "amount": 3}"#;
        let event: CreatedOrderEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            CreatedOrderEvent {
                order_id: 7,
                customer_id: 1,
                product_id: 2,
                amount: 3,
            }
        );
    }

    #[test]
    fn test_prepared_inventory_event_status_spelling() {
        let event = PreparedInventoryEvent {
            order_id: 7,
            customer_id: 1,
            product_id: 2,
            amount: 3,
            cost: 15,
            status: OrderStatus::OutOfStock,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "OUT_OF_STOCK");
        assert_eq!(json["order_id"], 7);
        assert_eq!(json["cost"], 15);
    }

    #[test]
    fn test_bill_event_round_trip() {
        let json = r#"{"order_id": 7, "amount": 3, "status": "EXCEED_CREDIT_LIMIT"}"#;
        let event: BillEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.status, OrderStatus::ExceedCreditLimit);
        let back = serde_json::to_string(&event).unwrap();
        let again: BillEvent = serde_json::from_str(&back).unwrap();
        assert_eq!(event, again);
    }
}
