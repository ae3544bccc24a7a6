//! Payment service store: customer accounts, the processed-order ledger and
//! the payment outbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use model::payment::ProcessedOrder;
use model::{Account, OutboxMessage};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Row;

use crate::outbox::{MemOutbox, PgOutboxTable};
use crate::{OutboxQueue, StoreError};

const OUTBOX: PgOutboxTable = PgOutboxTable::new("payment_outboxes");

/// Store for the Payment service.
#[derive(Clone)]
pub enum PaymentStore {
    Postgres(Pool),
    Memory(MemPaymentStore),
}

impl PaymentStore {
    pub fn postgres(pool: Pool) -> Self {
        PaymentStore::Postgres(pool)
    }

    pub fn memory() -> Self {
        PaymentStore::Memory(MemPaymentStore::default())
    }

    pub async fn conn(&self) -> Result<PaymentConn, StoreError> {
        match self {
            PaymentStore::Postgres(pool) => Ok(PaymentConn::Postgres(pool.get().await?)),
            PaymentStore::Memory(store) => Ok(PaymentConn::Memory(store.clone())),
        }
    }

    /// Seeds an account; used by provisioning and tests.
    pub async fn create_account(&self, customer_id: i64, balance: i64) -> Result<(), StoreError> {
        match self {
            PaymentStore::Postgres(pool) => {
                let conn = pool.get().await?;
                conn.execute(
                    "INSERT INTO accounts (customer_id, balance) VALUES ($1, $2)",
                    &[&customer_id, &balance],
                )
                .await?;
                Ok(())
            }
            PaymentStore::Memory(store) => {
                let mut state = store.state.lock().await;
                let now = Utc::now();
                state.accounts.insert(
                    customer_id,
                    Account {
                        customer_id,
                        balance,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn get_account(&self, customer_id: i64) -> Result<Account, StoreError> {
        match self {
            PaymentStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let row = conn
                    .query_opt(
                        "SELECT customer_id, balance, created_at, updated_at
                         FROM accounts WHERE customer_id = $1",
                        &[&customer_id],
                    )
                    .await?;
                match row {
                    Some(row) => Ok(row_to_account(&row)),
                    None => Err(StoreError::NotFound),
                }
            }
            PaymentStore::Memory(store) => {
                let state = store.state.lock().await;
                state
                    .accounts
                    .get(&customer_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)
            }
        }
    }

    pub async fn processed_order(
        &self,
        order_id: i64,
    ) -> Result<Option<ProcessedOrder>, StoreError> {
        match self {
            PaymentStore::Postgres(pool) => {
                let conn = pool.get().await?;
                let row = conn
                    .query_opt(
                        "SELECT order_id, created_at FROM processed_orders WHERE order_id = $1",
                        &[&order_id],
                    )
                    .await?;
                Ok(row.map(|row| ProcessedOrder {
                    order_id: row.get("order_id"),
                    created_at: row.get("created_at"),
                }))
            }
            PaymentStore::Memory(store) => {
                let state = store.state.lock().await;
                Ok(state.processed.get(&order_id).cloned())
            }
        }
    }

    /// Total outbox rows, DONE included; rows are never deleted.
    pub async fn count_outboxes(&self) -> Result<i64, StoreError> {
        match self {
            PaymentStore::Postgres(pool) => OUTBOX.count(&*pool.get().await?).await,
            PaymentStore::Memory(store) => Ok(store.state.lock().await.outbox.count()),
        }
    }
}

#[async_trait]
impl OutboxQueue for PaymentStore {
    async fn pending_outboxes(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        match self {
            PaymentStore::Postgres(pool) => OUTBOX.pending(&*pool.get().await?, limit).await,
            PaymentStore::Memory(store) => Ok(store.state.lock().await.outbox.pending(limit)),
        }
    }

    async fn mark_outboxes_done(&self, ids: &[i64]) -> Result<(), StoreError> {
        match self {
            PaymentStore::Postgres(pool) => OUTBOX.mark_done(&*pool.get().await?, ids).await,
            PaymentStore::Memory(store) => {
                store.state.lock().await.outbox.mark_done(ids);
                Ok(())
            }
        }
    }
}

pub enum PaymentConn {
    Postgres(deadpool_postgres::Object),
    Memory(MemPaymentStore),
}

impl PaymentConn {
    pub async fn begin(&mut self) -> Result<PaymentTx<'_>, StoreError> {
        match self {
            PaymentConn::Postgres(conn) => Ok(PaymentTx::Postgres(conn.transaction().await?)),
            PaymentConn::Memory(store) => Ok(PaymentTx::Memory(store.begin().await)),
        }
    }
}

/// An open transaction with the payment step's capability set.
pub enum PaymentTx<'a> {
    Postgres(deadpool_postgres::Transaction<'a>),
    Memory(MemPaymentTx<'a>),
}

impl PaymentTx<'_> {
    pub async fn is_processed(&mut self, order_id: i64) -> Result<bool, StoreError> {
        match self {
            PaymentTx::Postgres(tx) => {
                let row = tx
                    .query_opt(
                        "SELECT order_id FROM processed_orders WHERE order_id = $1",
                        &[&order_id],
                    )
                    .await?;
                Ok(row.is_some())
            }
            PaymentTx::Memory(tx) => Ok(tx.staged.processed.contains_key(&order_id)),
        }
    }

    /// Locks the customer's account row; concurrent debits for the same
    /// customer serialize on this lock.
    pub async fn lock_account(&mut self, customer_id: i64) -> Result<Account, StoreError> {
        match self {
            PaymentTx::Postgres(tx) => {
                let row = tx
                    .query_opt(
                        "SELECT customer_id, balance, created_at, updated_at
                         FROM accounts WHERE customer_id = $1 FOR UPDATE",
                        &[&customer_id],
                    )
                    .await?;
                match row {
                    Some(row) => Ok(row_to_account(&row)),
                    None => Err(StoreError::NotFound),
                }
            }
            PaymentTx::Memory(tx) => tx
                .staged
                .accounts
                .get(&customer_id)
                .cloned()
                .ok_or(StoreError::NotFound),
        }
    }

    pub async fn update_balance(
        &mut self,
        customer_id: i64,
        balance: i64,
    ) -> Result<(), StoreError> {
        match self {
            PaymentTx::Postgres(tx) => {
                tx.execute(
                    "UPDATE accounts SET balance = $2, updated_at = now() WHERE customer_id = $1",
                    &[&customer_id, &balance],
                )
                .await?;
                Ok(())
            }
            PaymentTx::Memory(tx) => {
                if let Some(account) = tx.staged.accounts.get_mut(&customer_id) {
                    account.balance = balance;
                    account.updated_at = Utc::now();
                }
                Ok(())
            }
        }
    }

    pub async fn insert_processed(&mut self, order_id: i64) -> Result<(), StoreError> {
        match self {
            PaymentTx::Postgres(tx) => {
                tx.execute(
                    "INSERT INTO processed_orders (order_id) VALUES ($1)",
                    &[&order_id],
                )
                .await?;
                Ok(())
            }
            PaymentTx::Memory(tx) => {
                if tx.staged.processed.contains_key(&order_id) {
                    return Err(StoreError::Duplicate);
                }
                tx.staged.processed.insert(
                    order_id,
                    ProcessedOrder {
                        order_id,
                        created_at: Utc::now(),
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn insert_outbox(&mut self, content: &[u8]) -> Result<(), StoreError> {
        match self {
            PaymentTx::Postgres(tx) => OUTBOX.insert(tx, content).await,
            PaymentTx::Memory(tx) => {
                tx.staged.outbox.insert(content.to_vec());
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        match self {
            PaymentTx::Postgres(tx) => Ok(tx.commit().await?),
            PaymentTx::Memory(tx) => {
                tx.commit();
                Ok(())
            }
        }
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self {
            PaymentTx::Postgres(tx) => Ok(tx.rollback().await?),
            PaymentTx::Memory(_) => Ok(()),
        }
    }
}

fn row_to_account(row: &Row) -> Account {
    Account {
        customer_id: row.get("customer_id"),
        balance: row.get("balance"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// In-memory payment store. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemPaymentStore {
    state: Arc<Mutex<PaymentState>>,
}

#[derive(Debug, Clone, Default)]
struct PaymentState {
    accounts: BTreeMap<i64, Account>,
    processed: BTreeMap<i64, ProcessedOrder>,
    outbox: MemOutbox,
}

impl MemPaymentStore {
    async fn begin(&self) -> MemPaymentTx<'_> {
        let guard = self.state.lock().await;
        let staged = guard.clone();
        MemPaymentTx { guard, staged }
    }
}

pub struct MemPaymentTx<'a> {
    guard: MutexGuard<'a, PaymentState>,
    staged: PaymentState,
}

impl MemPaymentTx<'_> {
    fn commit(mut self) {
        *self.guard = self.staged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debit_commits_atomically_with_ledger() {
        let store = PaymentStore::memory();
        store.create_account(1, 100).await.unwrap();

        let mut conn = store.conn().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        let account = tx.lock_account(1).await.unwrap();
        tx.update_balance(1, account.balance - 15).await.unwrap();
        tx.insert_processed(7).await.unwrap();
        tx.insert_outbox(b"bill").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.get_account(1).await.unwrap().balance, 85);
        assert!(store.processed_order(7).await.unwrap().is_some());
        assert_eq!(store.pending_outboxes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let store = PaymentStore::memory();
        let mut conn = store.conn().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        assert!(matches!(
            tx.lock_account(42).await,
            Err(StoreError::NotFound)
        ));
        tx.rollback().await.unwrap();
    }
}
