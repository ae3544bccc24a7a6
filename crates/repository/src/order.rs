//! Order service store: the orders table and its outbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use model::{NewOrder, Order, OrderStatus, OutboxMessage};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Row;

use crate::outbox::{MemOutbox, PgOutboxTable};
use crate::{OutboxQueue, StoreError};

const OUTBOX: PgOutboxTable = PgOutboxTable::new("order_outboxes");

/// Store for the Order service.
#[derive(Clone)]
pub enum OrderStore {
    Postgres(Pool),
    Memory(MemOrderStore),
}

impl OrderStore {
    pub fn postgres(pool: Pool) -> Self {
        OrderStore::Postgres(pool)
    }

    pub fn memory() -> Self {
        OrderStore::Memory(MemOrderStore::default())
    }

    /// Checks out a connection; `begin` on it opens a transaction.
    pub async fn conn(&self) -> Result<OrderConn, StoreError> {
        match self {
            OrderStore::Postgres(pool) => Ok(OrderConn::Postgres(pool.get().await?)),
            OrderStore::Memory(store) => Ok(OrderConn::Memory(store.clone())),
        }
    }

    pub async fn get_order(&self, id: i64) -> Result<Order, StoreError> {
        match self {
            OrderStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let row = conn
                    .query_opt(
                        "SELECT id, customer_id, product_id, amount, status, created_at, updated_at
                         FROM orders WHERE id = $1",
                        &[&id],
                    )
                    .await?;
                match row {
                    Some(row) => row_to_order(&row),
                    None => Err(StoreError::NotFound),
                }
            }
            OrderStore::Memory(store) => {
                let state = store.state.lock().await;
                state.orders.get(&id).cloned().ok_or(StoreError::NotFound)
            }
        }
    }

    /// Moves a PENDING order to `status`. The guard makes terminal statuses
    /// immutable and the update idempotent under redelivery; returns whether
    /// a row actually changed.
    pub async fn update_status(&self, id: i64, status: OrderStatus) -> Result<bool, StoreError> {
        match self {
            OrderStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let n = conn
                    .execute(
                        "UPDATE orders SET status = $2, updated_at = now()
                         WHERE id = $1 AND status = 'PENDING'",
                        &[&id, &status.as_str()],
                    )
                    .await?;
                Ok(n > 0)
            }
            OrderStore::Memory(store) => {
                let mut state = store.state.lock().await;
                match state.orders.get_mut(&id) {
                    Some(order) if order.status == OrderStatus::Pending => {
                        order.status = status;
                        order.updated_at = Utc::now();
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }
}

#[async_trait]
impl OutboxQueue for OrderStore {
    async fn pending_outboxes(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        match self {
            OrderStore::Postgres(pool) => OUTBOX.pending(&*pool.get().await?, limit).await,
            OrderStore::Memory(store) => Ok(store.state.lock().await.outbox.pending(limit)),
        }
    }

    async fn mark_outboxes_done(&self, ids: &[i64]) -> Result<(), StoreError> {
        match self {
            OrderStore::Postgres(pool) => OUTBOX.mark_done(&*pool.get().await?, ids).await,
            OrderStore::Memory(store) => {
                store.state.lock().await.outbox.mark_done(ids);
                Ok(())
            }
        }
    }
}

/// A checked-out connection to the order store.
pub enum OrderConn {
    Postgres(deadpool_postgres::Object),
    Memory(MemOrderStore),
}

impl OrderConn {
    pub async fn begin(&mut self) -> Result<OrderTx<'_>, StoreError> {
        match self {
            OrderConn::Postgres(conn) => Ok(OrderTx::Postgres(conn.transaction().await?)),
            OrderConn::Memory(store) => Ok(OrderTx::Memory(store.begin().await)),
        }
    }
}

/// An open transaction with the order step's capability set.
pub enum OrderTx<'a> {
    Postgres(deadpool_postgres::Transaction<'a>),
    Memory(MemOrderTx<'a>),
}

impl OrderTx<'_> {
    /// Inserts a PENDING order and returns its assigned id.
    pub async fn insert_order(&mut self, order: &NewOrder) -> Result<i64, StoreError> {
        match self {
            OrderTx::Postgres(tx) => {
                let row = tx
                    .query_one(
                        "INSERT INTO orders (customer_id, product_id, amount)
                         VALUES ($1, $2, $3) RETURNING id",
                        &[&order.customer_id, &order.product_id, &order.amount],
                    )
                    .await?;
                Ok(row.get(0))
            }
            OrderTx::Memory(tx) => Ok(tx.insert_order(order)),
        }
    }

    pub async fn insert_outbox(&mut self, content: &[u8]) -> Result<(), StoreError> {
        match self {
            OrderTx::Postgres(tx) => OUTBOX.insert(tx, content).await,
            OrderTx::Memory(tx) => {
                tx.staged.outbox.insert(content.to_vec());
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        match self {
            OrderTx::Postgres(tx) => Ok(tx.commit().await?),
            OrderTx::Memory(tx) => {
                tx.commit();
                Ok(())
            }
        }
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self {
            OrderTx::Postgres(tx) => Ok(tx.rollback().await?),
            OrderTx::Memory(_) => Ok(()),
        }
    }
}

fn row_to_order(row: &Row) -> Result<Order, StoreError> {
    let status: String = row.get("status");
    Ok(Order {
        id: row.get("id"),
        customer_id: row.get("customer_id"),
        product_id: row.get("product_id"),
        amount: row.get("amount"),
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// In-memory order store. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemOrderStore {
    state: Arc<Mutex<OrderState>>,
}

#[derive(Debug, Clone, Default)]
struct OrderState {
    next_id: i64,
    orders: BTreeMap<i64, Order>,
    outbox: MemOutbox,
}

impl MemOrderStore {
    /// Opens a transaction by staging a copy of the state; the mutex guard
    /// stands in for row locks until commit or drop.
    async fn begin(&self) -> MemOrderTx<'_> {
        let guard = self.state.lock().await;
        let staged = guard.clone();
        MemOrderTx { guard, staged }
    }
}

pub struct MemOrderTx<'a> {
    guard: MutexGuard<'a, OrderState>,
    staged: OrderState,
}

impl MemOrderTx<'_> {
    fn insert_order(&mut self, order: &NewOrder) -> i64 {
        self.staged.next_id += 1;
        let id = self.staged.next_id;
        let now = Utc::now();
        self.staged.orders.insert(
            id,
            Order {
                id,
                customer_id: order.customer_id,
                product_id: order.product_id,
                amount: order.amount,
                status: OrderStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn commit(mut self) {
        *self.guard = self.staged;
    }
}
