//! # Store adapters
//!
//! One store per service, owning that service's private tables. Each store
//! is a tagged capability with two variants: `Postgres` for production
//! (row-level `SELECT ... FOR UPDATE` locks, `UNIQUE(order_id)` enforcement)
//! and `Memory` for tests (mutex-serialized clone-on-write transactions).
//!
//! Transactions are explicit values: `store.conn().await?.begin().await?`
//! yields a typed transaction carrying exactly the capability set the
//! service's step handler needs; nothing becomes visible to other tasks
//! before `commit`.

use async_trait::async_trait;
use model::OutboxMessage;
use thiserror::Error;
use tokio_postgres::error::SqlState;

mod inventory;
mod order;
mod outbox;
mod payment;

pub use inventory::{InventoryConn, InventoryStore, InventoryTx, MemInventoryStore, MemInventoryTx};
pub use order::{MemOrderStore, MemOrderTx, OrderConn, OrderStore, OrderTx};
pub use payment::{MemPaymentStore, MemPaymentTx, PaymentConn, PaymentStore, PaymentTx};

/// Error types that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database-related errors, wrapping the underlying PostgreSQL error.
    #[error("database error: {0}")]
    Db(tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// No row matched.
    #[error("not found")]
    NotFound,
    /// A unique constraint rejected the write; for the processed-order
    /// ledger this is the idempotency CAS firing.
    #[error("duplicate key")]
    Duplicate,
    /// A row held a value the models cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            StoreError::Duplicate
        } else {
            StoreError::Db(e)
        }
    }
}

/// The relay's view of a store: drain PENDING outbox rows in insertion
/// order and mark published batches DONE. Every service store implements
/// this; the relay is generic over it.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Up to `limit` PENDING rows, FIFO by id.
    async fn pending_outboxes(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Marks the given rows DONE in one statement. Rows are never deleted.
    async fn mark_outboxes_done(&self, ids: &[i64]) -> Result<(), StoreError>;
}
