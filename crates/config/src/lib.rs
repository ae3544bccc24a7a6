use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Per-service settings. Services discover "which one am I" by matching
/// `name` against the CLI argument.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Service name ("order", "inventory" or "payment").
    pub name: String,
    /// Directory holding the service's SQL migrations.
    pub migration_dir: String,
    /// Postgres DSN for the service's private database.
    pub database_dsn: String,
}

/// `AppConfig` holds all configuration parameters for the saga backend.
///
/// Loaded from environment variables (optionally via a `.env` file) on top of
/// in-code defaults. Nested service tables are overridden with `__`-separated
/// variables, e.g. `ORDER__DATABASE_DSN`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Broker settings ---
    /// Kafka bootstrap host.
    pub broker_host: String,
    /// Topic carrying `CreatedOrderEvent`s (Order -> Inventory).
    pub order_topic: String,
    /// Topic carrying `PreparedInventoryEvent`s (Inventory -> Payment).
    pub prepared_inventory_topic: String,
    /// Topic carrying `BillEvent`s (Payment -> Order and Inventory).
    pub order_bill_topic: String,

    // --- Outbox relay ---
    /// Maximum outbox rows drained per relay tick.
    pub relay_batch_size: i64,
    /// Pause between relay ticks (human-friendly format, e.g. "1s").
    #[serde(deserialize_with = "deserialize_duration")]
    pub relay_interval: Duration,

    // --- Observability ---
    /// Port for the per-process /health and /metrics endpoint.
    pub metrics_port: u16,

    // --- Services ---
    pub order: ServiceConfig,
    pub inventory: ServiceConfig,
    pub payment: ServiceConfig,
}

/// Custom deserializer for durations, accepting formats like "500ms", "1s".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from a
    /// `.env` file), falling back to the defaults below.
    ///
    /// # Errors
    /// Returns an error if environment variables are present but invalid;
    /// the caller is expected to abort at startup.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Broker
            .set_default("broker_host", "localhost:9092")?
            .set_default("order_topic", "ORDER_CREATED")?
            .set_default("prepared_inventory_topic", "PREPARED_INVENTORY")?
            .set_default("order_bill_topic", "ORDER_BILL")?
            // Relay
            .set_default("relay_batch_size", 100)?
            .set_default("relay_interval", "1s")?
            // Observability
            .set_default("metrics_port", 9464)?
            // Order service
            .set_default("order.name", "order")?
            .set_default("order.migration_dir", "migrations/order")?
            .set_default(
                "order.database_dsn",
                "host=localhost port=5432 user=saga password=saga dbname=saga_order",
            )?
            // Inventory service
            .set_default("inventory.name", "inventory")?
            .set_default("inventory.migration_dir", "migrations/inventory")?
            .set_default(
                "inventory.database_dsn",
                "host=localhost port=5432 user=saga password=saga dbname=saga_inventory",
            )?
            // Payment service
            .set_default("payment.name", "payment")?
            .set_default("payment.migration_dir", "migrations/payment")?
            .set_default(
                "payment.database_dsn",
                "host=localhost port=5432 user=saga password=saga dbname=saga_payment",
            )?
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Looks up the service configuration by its configured name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        [&self.order, &self.inventory, &self.payment]
            .into_iter()
            .find(|svc| svc.name == name)
    }
}
