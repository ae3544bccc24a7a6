//! Order service core: order creation with its outbox event, and the
//! terminal status update driven by `ORDER_BILL`.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_consumer::{EventHandler, HandlerError};
use model::{BillEvent, CreatedOrderEvent, NewOrder, Order, OrderStatus};
use repository::{OrderStore, OrderTx};
use tracing::{debug, info, warn};

use crate::{SagaMetrics, ServiceError};

pub struct OrderService {
    store: OrderStore,
    metrics: Arc<SagaMetrics>,
}

impl OrderService {
    pub fn new(store: OrderStore, metrics: Arc<SagaMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Atomically inserts the order in PENDING and captures its
    /// `CreatedOrderEvent` in the outbox. Returns the assigned order id;
    /// on any failure the caller sees no side effects.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<i64, ServiceError> {
        if new_order.amount <= 0 {
            return Err(ServiceError::InvalidOrder(
                "amount must be positive".into(),
            ));
        }

        let mut conn = self.store.conn().await?;
        let mut tx = conn.begin().await?;
        match create_in_tx(&mut tx, &new_order).await {
            Ok(id) => {
                tx.commit().await?;
                self.metrics.orders_created_total.inc();
                info!(order_id = id, "order created");
                Ok(id)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("rollback after failed create failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Applies a terminal status delivered on `ORDER_BILL`. The store guards
    /// the update on the order still being PENDING, so terminal states stay
    /// immutable and redeliveries are no-ops.
    pub async fn update_status(&self, id: i64, status: OrderStatus) -> Result<(), ServiceError> {
        let changed = self.store.update_status(id, status).await?;
        if changed {
            self.metrics
                .bills_applied_total
                .with_label_values(&[status.as_str()])
                .inc();
            info!(order_id = id, status = %status, "order reached terminal status");
        } else {
            debug!(order_id = id, status = %status, "status update skipped, order not pending");
        }
        Ok(())
    }

    pub async fn get_order(&self, id: i64) -> Result<Order, ServiceError> {
        Ok(self.store.get_order(id).await?)
    }
}

async fn create_in_tx(tx: &mut OrderTx<'_>, new_order: &NewOrder) -> Result<i64, ServiceError> {
    let id = tx.insert_order(new_order).await?;
    let event = CreatedOrderEvent {
        order_id: id,
        customer_id: new_order.customer_id,
        product_id: new_order.product_id,
        amount: new_order.amount,
    };
    tx.insert_outbox(&serde_json::to_vec(&event)?).await?;
    Ok(id)
}

/// Binds `ORDER_BILL` to the status update.
pub struct BillHandler {
    service: Arc<OrderService>,
}

impl BillHandler {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for BillHandler {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let event: BillEvent = serde_json::from_slice(payload)?;
        self.service
            .update_status(event.order_id, event.status)
            .await
            .map_err(HandlerError::retry)
    }
}
