//! Business cores of the three saga services.
//!
//! Each service makes its business decision inside a single store
//! transaction that encloses the idempotency check, the row lock, the
//! mutation, the ledger insert and the outbox insert; commit is the only
//! point where anything becomes visible. The shared [`relay::OutboxRelay`]
//! drains each service's outbox to its single outbound topic, and the
//! `EventHandler` implementations bind topics to steps.

pub mod inventory;
pub mod metrics;
pub mod order;
pub mod payment;
pub mod relay;

use kafka_producer::PublishError;
use repository::StoreError;
use thiserror::Error;

pub use inventory::{InventoryService, PrepareHandler, RestoreHandler};
pub use metrics::SagaMetrics;
pub use order::{BillHandler, OrderService};
pub use payment::{PayHandler, PaymentService};
pub use relay::OutboxRelay;

/// The main error type for all saga service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The requested order is structurally invalid.
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    /// A store operation failed; the enclosing transaction was rolled back.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    /// An event payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// Publishing a relayed batch failed; the outbox rows stay PENDING.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
}
