//! Domain entities and saga event payloads shared by all three services.
//!
//! Entities mirror each service's private tables; events are the JSON
//! payloads exchanged over the broker topics. No service reads another
//! service's entities directly.

pub mod event;
pub mod inventory;
pub mod order;
pub mod outbox;
pub mod payment;

pub use event::{BillEvent, CreatedOrderEvent, PreparedInventoryEvent};
pub use inventory::Inventory;
pub use order::{NewOrder, Order, OrderStatus};
pub use outbox::{OutboxMessage, OutboxStatus};
pub use payment::Account;
