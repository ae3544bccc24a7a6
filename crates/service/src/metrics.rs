//! Saga progress counters, exposed through the per-process /metrics route.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Counters shared by the service cores and the relay.
#[derive(Clone)]
pub struct SagaMetrics {
    pub orders_created_total: IntCounter,
    /// Prepare outcomes, labeled PREPARED or OUT_OF_STOCK.
    pub inventory_prepared_total: IntCounterVec,
    pub inventory_restored_total: IntCounter,
    /// Payment outcomes, labeled by the produced bill status.
    pub payments_total: IntCounterVec,
    /// Terminal statuses applied to orders.
    pub bills_applied_total: IntCounterVec,
    /// Outbox rows published, labeled by topic.
    pub events_relayed_total: IntCounterVec,
}

impl SagaMetrics {
    pub fn new() -> Self {
        let orders_created_total = IntCounter::new(
            "saga_orders_created_total",
            "Total number of orders created",
        )
        .expect("Failed to create saga_orders_created_total metric");

        let inventory_prepared_total = IntCounterVec::new(
            Opts::new(
                "saga_inventory_prepared_total",
                "Prepare-inventory outcomes by status",
            ),
            &["status"],
        )
        .expect("Failed to create saga_inventory_prepared_total metric");

        let inventory_restored_total = IntCounter::new(
            "saga_inventory_restored_total",
            "Total number of compensated reservations",
        )
        .expect("Failed to create saga_inventory_restored_total metric");

        let payments_total = IntCounterVec::new(
            Opts::new("saga_payments_total", "Payment outcomes by status"),
            &["status"],
        )
        .expect("Failed to create saga_payments_total metric");

        let bills_applied_total = IntCounterVec::new(
            Opts::new(
                "saga_bills_applied_total",
                "Terminal statuses applied to orders",
            ),
            &["status"],
        )
        .expect("Failed to create saga_bills_applied_total metric");

        let events_relayed_total = IntCounterVec::new(
            Opts::new("saga_events_relayed_total", "Outbox rows published by topic"),
            &["topic"],
        )
        .expect("Failed to create saga_events_relayed_total metric");

        Self {
            orders_created_total,
            inventory_prepared_total,
            inventory_restored_total,
            payments_total,
            bills_applied_total,
            events_relayed_total,
        }
    }

    /// Registers every counter on the given registry.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.orders_created_total.clone()))?;
        registry.register(Box::new(self.inventory_prepared_total.clone()))?;
        registry.register(Box::new(self.inventory_restored_total.clone()))?;
        registry.register(Box::new(self.payments_total.clone()))?;
        registry.register(Box::new(self.bills_applied_total.clone()))?;
        registry.register(Box::new(self.events_relayed_total.clone()))?;
        Ok(())
    }
}

impl Default for SagaMetrics {
    fn default() -> Self {
        Self::new()
    }
}
