//! Payment service core: billing on `PREPARED_INVENTORY`.
//!
//! A PREPARED event debits the customer's account (or produces
//! EXCEED_CREDIT_LIMIT). An OUT_OF_STOCK event touches no account; it is
//! forwarded as the saga's terminal bill so the Order service still reaches
//! a terminal status and Inventory sees the failure branch on `ORDER_BILL`.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_consumer::{EventHandler, HandlerError};
use model::{BillEvent, OrderStatus, PreparedInventoryEvent};
use repository::{PaymentStore, PaymentTx};
use tracing::{debug, info, warn};

use crate::{SagaMetrics, ServiceError};

pub struct PaymentService {
    store: PaymentStore,
    metrics: Arc<SagaMetrics>,
}

impl PaymentService {
    pub fn new(store: PaymentStore, metrics: Arc<SagaMetrics>) -> Self {
        Self { store, metrics }
    }

    /// The billing step. One transaction covers the idempotency gate, the
    /// account row lock, the debit (or the EXCEED_CREDIT_LIMIT decision),
    /// the ledger insert and the produced bill.
    pub async fn pay(&self, event: &PreparedInventoryEvent) -> Result<(), ServiceError> {
        if event.status != OrderStatus::Prepared && event.status != OrderStatus::OutOfStock {
            debug!(
                order_id = event.order_id,
                status = %event.status,
                "unexpected inventory status, skipped"
            );
            return Ok(());
        }

        let mut conn = self.store.conn().await?;
        let mut tx = conn.begin().await?;
        match pay_in_tx(&mut tx, event).await {
            Ok(Some(status)) => {
                tx.commit().await?;
                self.metrics
                    .payments_total
                    .with_label_values(&[status.as_str()])
                    .inc();
                info!(order_id = event.order_id, status = %status, "bill produced");
                Ok(())
            }
            Ok(None) => {
                tx.commit().await?;
                debug!(order_id = event.order_id, "order already processed");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("rollback after failed payment failed: {rb}");
                }
                Err(e)
            }
        }
    }
}

async fn pay_in_tx(
    tx: &mut PaymentTx<'_>,
    event: &PreparedInventoryEvent,
) -> Result<Option<OrderStatus>, ServiceError> {
    if tx.is_processed(event.order_id).await? {
        return Ok(None);
    }

    let status = if event.status == OrderStatus::Prepared {
        let account = tx.lock_account(event.customer_id).await?;
        if account.balance >= i64::from(event.cost) {
            tx.update_balance(event.customer_id, account.balance - i64::from(event.cost))
                .await?;
            OrderStatus::Billed
        } else {
            OrderStatus::ExceedCreditLimit
        }
    } else {
        // The prepare failed upstream; pass the outcome through unchanged.
        OrderStatus::OutOfStock
    };

    let produced = BillEvent {
        order_id: event.order_id,
        amount: event.amount,
        status,
    };
    tx.insert_processed(event.order_id).await?;
    tx.insert_outbox(&serde_json::to_vec(&produced)?).await?;
    Ok(Some(status))
}

/// Binds `PREPARED_INVENTORY` to the billing step.
pub struct PayHandler {
    service: Arc<PaymentService>,
}

impl PayHandler {
    pub fn new(service: Arc<PaymentService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PayHandler {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: PreparedInventoryEvent = serde_json::from_slice(payload)?;
        self.service.pay(&event).await.map_err(HandlerError::retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repository::OutboxQueue;

    fn prepared(order_id: i64, cost: i32) -> PreparedInventoryEvent {
        PreparedInventoryEvent {
            order_id,
            customer_id: 1,
            product_id: 2,
            amount: 3,
            cost,
            status: OrderStatus::Prepared,
        }
    }

    #[tokio::test]
    async fn test_pay_debits_and_bills() {
        let store = PaymentStore::memory();
        store.create_account(1, 100).await.unwrap();
        let svc = PaymentService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.pay(&prepared(7, 15)).await.unwrap();

        assert_eq!(store.get_account(1).await.unwrap().balance, 85);
        let pending = store.pending_outboxes(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let bill: BillEvent = serde_json::from_slice(&pending[0].content).unwrap();
        assert_eq!(bill.status, OrderStatus::Billed);
        assert_eq!(bill.order_id, 7);
    }

    #[tokio::test]
    async fn test_pay_exceeding_credit_limit_keeps_balance() {
        let store = PaymentStore::memory();
        store.create_account(1, 14).await.unwrap();
        let svc = PaymentService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.pay(&prepared(7, 15)).await.unwrap();

        assert_eq!(store.get_account(1).await.unwrap().balance, 14);
        let pending = store.pending_outboxes(10).await.unwrap();
        let bill: BillEvent = serde_json::from_slice(&pending[0].content).unwrap();
        assert_eq!(bill.status, OrderStatus::ExceedCreditLimit);
    }

    #[tokio::test]
    async fn test_pay_is_idempotent_under_redelivery() {
        let store = PaymentStore::memory();
        store.create_account(1, 100).await.unwrap();
        let svc = PaymentService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.pay(&prepared(7, 15)).await.unwrap();
        svc.pay(&prepared(7, 15)).await.unwrap();

        assert_eq!(store.get_account(1).await.unwrap().balance, 85);
        assert_eq!(store.count_outboxes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_stock_is_forwarded_without_touching_accounts() {
        let store = PaymentStore::memory();
        store.create_account(1, 100).await.unwrap();
        let svc = PaymentService::new(store.clone(), Arc::new(SagaMetrics::new()));

        let mut event = prepared(7, 0);
        event.status = OrderStatus::OutOfStock;
        svc.pay(&event).await.unwrap();

        assert_eq!(store.get_account(1).await.unwrap().balance, 100);
        let pending = store.pending_outboxes(10).await.unwrap();
        let bill: BillEvent = serde_json::from_slice(&pending[0].content).unwrap();
        assert_eq!(bill.status, OrderStatus::OutOfStock);
    }
}
