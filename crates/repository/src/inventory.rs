//! Inventory service store: stock rows, the processed-order ledger with its
//! reservation marker, and the inventory outbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use model::inventory::ProcessedOrder;
use model::{Inventory, OutboxMessage};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Row;

use crate::outbox::{MemOutbox, PgOutboxTable};
use crate::{OutboxQueue, StoreError};

const OUTBOX: PgOutboxTable = PgOutboxTable::new("inventory_outboxes");

/// Store for the Inventory service.
#[derive(Clone)]
pub enum InventoryStore {
    Postgres(Pool),
    Memory(MemInventoryStore),
}

impl InventoryStore {
    pub fn postgres(pool: Pool) -> Self {
        InventoryStore::Postgres(pool)
    }

    pub fn memory() -> Self {
        InventoryStore::Memory(MemInventoryStore::default())
    }

    pub async fn conn(&self) -> Result<InventoryConn, StoreError> {
        match self {
            InventoryStore::Postgres(pool) => Ok(InventoryConn::Postgres(pool.get().await?)),
            InventoryStore::Memory(store) => Ok(InventoryConn::Memory(store.clone())),
        }
    }

    /// Seeds a stock row; used by provisioning and tests.
    pub async fn create_inventory(
        &self,
        product_id: i64,
        unit_price: i32,
        amount: i32,
    ) -> Result<(), StoreError> {
        match self {
            InventoryStore::Postgres(pool) => {
                let conn = pool.get().await?;
                conn.execute(
                    "INSERT INTO inventory (product_id, unit_price, amount) VALUES ($1, $2, $3)",
                    &[&product_id, &unit_price, &amount],
                )
                .await?;
                Ok(())
            }
            InventoryStore::Memory(store) => {
                let mut state = store.state.lock().await;
                let now = Utc::now();
                state.inventory.insert(
                    product_id,
                    Inventory {
                        product_id,
                        unit_price,
                        amount,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn get_inventory(&self, product_id: i64) -> Result<Inventory, StoreError> {
        match self {
            InventoryStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let row = conn
                    .query_opt(
                        "SELECT product_id, unit_price, amount, created_at, updated_at
                         FROM inventory WHERE product_id = $1",
                        &[&product_id],
                    )
                    .await?;
                match row {
                    Some(row) => Ok(row_to_inventory(&row)),
                    None => Err(StoreError::NotFound),
                }
            }
            InventoryStore::Memory(store) => {
                let state = store.state.lock().await;
                state
                    .inventory
                    .get(&product_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)
            }
        }
    }

    /// Ledger row for an order, if the order was already acted upon.
    pub async fn processed_order(
        &self,
        order_id: i64,
    ) -> Result<Option<ProcessedOrder>, StoreError> {
        match self {
            InventoryStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let row = conn
                    .query_opt(
                        "SELECT order_id, product_id, amount, reserved, created_at
                         FROM processed_orders WHERE order_id = $1",
                        &[&order_id],
                    )
                    .await?;
                Ok(row.map(|row| row_to_processed(&row)))
            }
            InventoryStore::Memory(store) => {
                let state = store.state.lock().await;
                Ok(state.processed.get(&order_id).cloned())
            }
        }
    }

    /// Total outbox rows, DONE included; rows are never deleted.
    pub async fn count_outboxes(&self) -> Result<i64, StoreError> {
        match self {
            InventoryStore::Postgres(pool) => OUTBOX.count(&*pool.get().await?).await,
            InventoryStore::Memory(store) => Ok(store.state.lock().await.outbox.count()),
        }
    }
}

#[async_trait]
impl OutboxQueue for InventoryStore {
    async fn pending_outboxes(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        match self {
            InventoryStore::Postgres(pool) => OUTBOX.pending(&*pool.get().await?, limit).await,
            InventoryStore::Memory(store) => Ok(store.state.lock().await.outbox.pending(limit)),
        }
    }

    async fn mark_outboxes_done(&self, ids: &[i64]) -> Result<(), StoreError> {
        match self {
            InventoryStore::Postgres(pool) => OUTBOX.mark_done(&*pool.get().await?, ids).await,
            InventoryStore::Memory(store) => {
                store.state.lock().await.outbox.mark_done(ids);
                Ok(())
            }
        }
    }
}

pub enum InventoryConn {
    Postgres(deadpool_postgres::Object),
    Memory(MemInventoryStore),
}

impl InventoryConn {
    pub async fn begin(&mut self) -> Result<InventoryTx<'_>, StoreError> {
        match self {
            InventoryConn::Postgres(conn) => Ok(InventoryTx::Postgres(conn.transaction().await?)),
            InventoryConn::Memory(store) => Ok(InventoryTx::Memory(store.begin().await)),
        }
    }
}

/// An open transaction with the prepare/restore capability set.
pub enum InventoryTx<'a> {
    Postgres(deadpool_postgres::Transaction<'a>),
    Memory(MemInventoryTx<'a>),
}

impl InventoryTx<'_> {
    /// The idempotency gate: has this order already been acted upon?
    pub async fn is_processed(&mut self, order_id: i64) -> Result<bool, StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                let row = tx
                    .query_opt(
                        "SELECT order_id FROM processed_orders WHERE order_id = $1",
                        &[&order_id],
                    )
                    .await?;
                Ok(row.is_some())
            }
            InventoryTx::Memory(tx) => Ok(tx.staged.processed.contains_key(&order_id)),
        }
    }

    /// Locks the stock row for the product; concurrent reservations for the
    /// same product serialize on this lock.
    pub async fn lock_inventory(&mut self, product_id: i64) -> Result<Inventory, StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                let row = tx
                    .query_opt(
                        "SELECT product_id, unit_price, amount, created_at, updated_at
                         FROM inventory WHERE product_id = $1 FOR UPDATE",
                        &[&product_id],
                    )
                    .await?;
                match row {
                    Some(row) => Ok(row_to_inventory(&row)),
                    None => Err(StoreError::NotFound),
                }
            }
            InventoryTx::Memory(tx) => tx
                .staged
                .inventory
                .get(&product_id)
                .cloned()
                .ok_or(StoreError::NotFound),
        }
    }

    pub async fn update_amount(&mut self, product_id: i64, amount: i32) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                tx.execute(
                    "UPDATE inventory SET amount = $2, updated_at = now() WHERE product_id = $1",
                    &[&product_id, &amount],
                )
                .await?;
                Ok(())
            }
            InventoryTx::Memory(tx) => {
                if let Some(inventory) = tx.staged.inventory.get_mut(&product_id) {
                    inventory.amount = amount;
                    inventory.updated_at = Utc::now();
                }
                Ok(())
            }
        }
    }

    /// Records the order in the ledger. `reserved` is set only when stock
    /// was deducted, so compensation can tell a real reservation from an
    /// OUT_OF_STOCK outcome. The primary key doubles as the idempotency CAS.
    pub async fn insert_processed(
        &mut self,
        order_id: i64,
        product_id: i64,
        amount: i32,
        reserved: bool,
    ) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                tx.execute(
                    "INSERT INTO processed_orders (order_id, product_id, amount, reserved)
                     VALUES ($1, $2, $3, $4)",
                    &[&order_id, &product_id, &amount, &reserved],
                )
                .await?;
                Ok(())
            }
            InventoryTx::Memory(tx) => {
                if tx.staged.processed.contains_key(&order_id) {
                    return Err(StoreError::Duplicate);
                }
                tx.staged.processed.insert(
                    order_id,
                    ProcessedOrder {
                        order_id,
                        product_id,
                        amount,
                        reserved,
                        created_at: Utc::now(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Locks the ledger row for a compensation decision.
    pub async fn lock_processed(
        &mut self,
        order_id: i64,
    ) -> Result<Option<ProcessedOrder>, StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                let row = tx
                    .query_opt(
                        "SELECT order_id, product_id, amount, reserved, created_at
                         FROM processed_orders WHERE order_id = $1 FOR UPDATE",
                        &[&order_id],
                    )
                    .await?;
                Ok(row.map(|row| row_to_processed(&row)))
            }
            InventoryTx::Memory(tx) => Ok(tx.staged.processed.get(&order_id).cloned()),
        }
    }

    /// Clears the reservation marker once the stock has been restored,
    /// making the restore idempotent.
    pub async fn clear_reserved(&mut self, order_id: i64) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => {
                tx.execute(
                    "UPDATE processed_orders SET reserved = FALSE WHERE order_id = $1",
                    &[&order_id],
                )
                .await?;
                Ok(())
            }
            InventoryTx::Memory(tx) => {
                if let Some(processed) = tx.staged.processed.get_mut(&order_id) {
                    processed.reserved = false;
                }
                Ok(())
            }
        }
    }

    pub async fn insert_outbox(&mut self, content: &[u8]) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => OUTBOX.insert(tx, content).await,
            InventoryTx::Memory(tx) => {
                tx.staged.outbox.insert(content.to_vec());
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => Ok(tx.commit().await?),
            InventoryTx::Memory(tx) => {
                tx.commit();
                Ok(())
            }
        }
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self {
            InventoryTx::Postgres(tx) => Ok(tx.rollback().await?),
            InventoryTx::Memory(_) => Ok(()),
        }
    }
}

fn row_to_inventory(row: &Row) -> Inventory {
    Inventory {
        product_id: row.get("product_id"),
        unit_price: row.get("unit_price"),
        amount: row.get("amount"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_processed(row: &Row) -> ProcessedOrder {
    ProcessedOrder {
        order_id: row.get("order_id"),
        product_id: row.get("product_id"),
        amount: row.get("amount"),
        reserved: row.get("reserved"),
        created_at: row.get("created_at"),
    }
}

/// In-memory inventory store. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemInventoryStore {
    state: Arc<Mutex<InventoryState>>,
}

#[derive(Debug, Clone, Default)]
struct InventoryState {
    inventory: BTreeMap<i64, Inventory>,
    processed: BTreeMap<i64, ProcessedOrder>,
    outbox: MemOutbox,
}

impl MemInventoryStore {
    async fn begin(&self) -> MemInventoryTx<'_> {
        let guard = self.state.lock().await;
        let staged = guard.clone();
        MemInventoryTx { guard, staged }
    }
}

pub struct MemInventoryTx<'a> {
    guard: MutexGuard<'a, InventoryState>,
    staged: InventoryState,
}

impl MemInventoryTx<'_> {
    fn commit(mut self) {
        *self.guard = self.staged;
    }
}
