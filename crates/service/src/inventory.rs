//! Inventory service core: stock reservation on `ORDER_CREATED` and
//! compensation on non-BILLED `ORDER_BILL` outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_consumer::{EventHandler, HandlerError};
use model::{BillEvent, CreatedOrderEvent, OrderStatus, PreparedInventoryEvent};
use repository::{InventoryStore, InventoryTx};
use tracing::{debug, info, warn};

use crate::{SagaMetrics, ServiceError};

pub struct InventoryService {
    store: InventoryStore,
    metrics: Arc<SagaMetrics>,
}

impl InventoryService {
    pub fn new(store: InventoryStore, metrics: Arc<SagaMetrics>) -> Self {
        Self { store, metrics }
    }

    /// The prepare step. One transaction covers the idempotency gate, the
    /// stock row lock, the reservation (or the OUT_OF_STOCK decision), the
    /// ledger insert and the produced event; a redelivered order commits
    /// empty at the gate.
    pub async fn prepare_inventory(&self, event: &CreatedOrderEvent) -> Result<(), ServiceError> {
        let mut conn = self.store.conn().await?;
        let mut tx = conn.begin().await?;
        match prepare_in_tx(&mut tx, event).await {
            Ok(Some(status)) => {
                tx.commit().await?;
                self.metrics
                    .inventory_prepared_total
                    .with_label_values(&[status.as_str()])
                    .inc();
                info!(order_id = event.order_id, status = %status, "inventory prepared");
                Ok(())
            }
            Ok(None) => {
                tx.commit().await?;
                debug!(order_id = event.order_id, "order already processed");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("rollback after failed prepare failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// The compensating step. Restores stock only when the ledger row says
    /// this order actually reserved it, then clears the marker; OUT_OF_STOCK
    /// echoes and redelivered bills are no-ops.
    pub async fn restore_inventory(&self, event: &BillEvent) -> Result<(), ServiceError> {
        let mut conn = self.store.conn().await?;
        let mut tx = conn.begin().await?;
        match restore_in_tx(&mut tx, event).await {
            Ok(restored) => {
                tx.commit().await?;
                if restored {
                    self.metrics.inventory_restored_total.inc();
                    info!(order_id = event.order_id, "reservation restored");
                } else {
                    debug!(order_id = event.order_id, "nothing reserved, restore skipped");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("rollback after failed restore failed: {rb}");
                }
                Err(e)
            }
        }
    }
}

async fn prepare_in_tx(
    tx: &mut InventoryTx<'_>,
    event: &CreatedOrderEvent,
) -> Result<Option<OrderStatus>, ServiceError> {
    if tx.is_processed(event.order_id).await? {
        return Ok(None);
    }

    let inventory = tx.lock_inventory(event.product_id).await?;
    let (status, cost, reserved) = if inventory.amount >= event.amount {
        tx.update_amount(event.product_id, inventory.amount - event.amount)
            .await?;
        (
            OrderStatus::Prepared,
            inventory.unit_price * event.amount,
            true,
        )
    } else {
        (OrderStatus::OutOfStock, 0, false)
    };

    let produced = PreparedInventoryEvent {
        order_id: event.order_id,
        customer_id: event.customer_id,
        product_id: event.product_id,
        amount: event.amount,
        cost,
        status,
    };
    tx.insert_processed(event.order_id, event.product_id, event.amount, reserved)
        .await?;
    tx.insert_outbox(&serde_json::to_vec(&produced)?).await?;
    Ok(Some(status))
}

async fn restore_in_tx(
    tx: &mut InventoryTx<'_>,
    event: &BillEvent,
) -> Result<bool, ServiceError> {
    let Some(processed) = tx.lock_processed(event.order_id).await? else {
        return Ok(false);
    };
    if !processed.reserved {
        return Ok(false);
    }

    let inventory = tx.lock_inventory(processed.product_id).await?;
    tx.update_amount(processed.product_id, inventory.amount + processed.amount)
        .await?;
    tx.clear_reserved(event.order_id).await?;
    Ok(true)
}

/// Binds `ORDER_CREATED` to the prepare step.
pub struct PrepareHandler {
    service: Arc<InventoryService>,
}

impl PrepareHandler {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PrepareHandler {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: CreatedOrderEvent = serde_json::from_slice(payload)?;
        self.service
            .prepare_inventory(&event)
            .await
            .map_err(HandlerError::retry)
    }
}

/// Binds `ORDER_BILL` to the compensating step.
pub struct RestoreHandler {
    service: Arc<InventoryService>,
}

impl RestoreHandler {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for RestoreHandler {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: BillEvent = serde_json::from_slice(payload)?;
        if event.status == OrderStatus::Billed {
            return Ok(());
        }
        self.service
            .restore_inventory(&event)
            .await
            .map_err(HandlerError::retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repository::OutboxQueue;

    fn created(order_id: i64, amount: i32) -> CreatedOrderEvent {
        CreatedOrderEvent {
            order_id,
            customer_id: 1,
            product_id: 2,
            amount,
        }
    }

    #[tokio::test]
    async fn test_prepare_reserves_stock_and_costs_it() {
        let store = InventoryStore::memory();
        store.create_inventory(2, 5, 100).await.unwrap();
        let svc = InventoryService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.prepare_inventory(&created(7, 3)).await.unwrap();

        assert_eq!(store.get_inventory(2).await.unwrap().amount, 97);
        let processed = store.processed_order(7).await.unwrap().unwrap();
        assert!(processed.reserved);

        let pending = store.pending_outboxes(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let event: PreparedInventoryEvent = serde_json::from_slice(&pending[0].content).unwrap();
        assert_eq!(event.status, OrderStatus::Prepared);
        assert_eq!(event.cost, 15);
    }

    #[tokio::test]
    async fn test_prepare_out_of_stock_leaves_amount_untouched() {
        let store = InventoryStore::memory();
        store.create_inventory(2, 5, 2).await.unwrap();
        let svc = InventoryService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.prepare_inventory(&created(7, 3)).await.unwrap();

        assert_eq!(store.get_inventory(2).await.unwrap().amount, 2);
        let processed = store.processed_order(7).await.unwrap().unwrap();
        assert!(!processed.reserved);

        let pending = store.pending_outboxes(10).await.unwrap();
        let event: PreparedInventoryEvent = serde_json::from_slice(&pending[0].content).unwrap();
        assert_eq!(event.status, OrderStatus::OutOfStock);
        assert_eq!(event.cost, 0);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent_under_redelivery() {
        let store = InventoryStore::memory();
        store.create_inventory(2, 5, 100).await.unwrap();
        let svc = InventoryService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.prepare_inventory(&created(7, 3)).await.unwrap();
        svc.prepare_inventory(&created(7, 3)).await.unwrap();

        assert_eq!(store.get_inventory(2).await.unwrap().amount, 97);
        assert_eq!(store.count_outboxes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_only_once_and_only_when_reserved() {
        let store = InventoryStore::memory();
        store.create_inventory(2, 5, 100).await.unwrap();
        let svc = InventoryService::new(store.clone(), Arc::new(SagaMetrics::new()));

        svc.prepare_inventory(&created(7, 3)).await.unwrap();
        assert_eq!(store.get_inventory(2).await.unwrap().amount, 97);

        let bill = BillEvent {
            order_id: 7,
            amount: 3,
            status: OrderStatus::ExceedCreditLimit,
        };
        svc.restore_inventory(&bill).await.unwrap();
        assert_eq!(store.get_inventory(2).await.unwrap().amount, 100);
        assert!(!store.processed_order(7).await.unwrap().unwrap().reserved);

        // A redelivered bill finds the marker cleared and changes nothing.
        svc.restore_inventory(&bill).await.unwrap();
        assert_eq!(store.get_inventory(2).await.unwrap().amount, 100);

        // A bill for an order that never reserved is a no-op too.
        svc.restore_inventory(&BillEvent {
            order_id: 99,
            amount: 5,
            status: OrderStatus::OutOfStock,
        })
        .await
        .unwrap();
        assert_eq!(store.get_inventory(2).await.unwrap().amount, 100);
    }
}
