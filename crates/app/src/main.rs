//! Saga backend entry point.
//!
//! One binary serves all three services: `migrate-create` and `migrate-up`
//! manage a service's schema, while `run` starts a service's task set (one
//! consumer per subscribed topic, the periodic outbox relay, and the ops
//! endpoint) until the process receives a shutdown signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use app_config::{AppConfig, ServiceConfig};
use clap::{Parser, Subcommand};
use kafka_consumer::{EventHandler, TopicConsumer};
use kafka_producer::EventPublisher;
use prometheus::Registry;
use repository::{InventoryStore, OrderStore, PaymentStore};
use server::OpsServer;
use service::{
    BillHandler, InventoryService, OrderService, OutboxRelay, PayHandler, PaymentService,
    PrepareHandler, RestoreHandler, SagaMetrics,
};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "saga", about = "Choreography saga backend for orders")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create empty up/down SQL migration files for a service
    MigrateCreate { service: String, name: String },
    /// Apply all pending migrations for a service
    MigrateUp { service: String },
    /// Run a service: its consumers, outbox relay and ops endpoint
    Run { service: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("configuration is invalid")?;

    match cli.command {
        Command::MigrateCreate { service, name } => migrate_create(&config, &service, &name).await,
        Command::MigrateUp { service } => migrate_up(&config, &service).await,
        Command::Run { service } => run(&config, &service).await,
    }
}

fn service_config<'a>(config: &'a AppConfig, name: &str) -> Result<&'a ServiceConfig> {
    config
        .service(name)
        .with_context(|| format!("unknown service: {name}"))
}

async fn migrate_create(config: &AppConfig, service: &str, name: &str) -> Result<()> {
    let svc = service_config(config, service)?;
    let (up, down) = db::create_migration(&svc.migration_dir, name).await?;
    println!("Created SQL up script: {}", up.display());
    println!("Created SQL down script: {}", down.display());
    Ok(())
}

async fn migrate_up(config: &AppConfig, service: &str) -> Result<()> {
    let svc = service_config(config, service)?;
    let pool = db::init_db_pool(svc).await?;
    let client = pool.get().await?;
    let applied = db::run_pending_migrations(&client, &svc.migration_dir).await?;
    if applied == 0 {
        println!("No change in migration");
    } else {
        println!("Migrated up");
    }
    Ok(())
}

async fn run(config: &AppConfig, service: &str) -> Result<()> {
    let svc = service_config(config, service)?.clone();
    let pool = db::init_db_pool(&svc).await?;

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(SagaMetrics::new());
    metrics
        .register(&registry)
        .context("Failed to register metrics")?;

    let shutdown = Arc::new(Notify::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.notify_waiters();
        }
    });

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if svc.name == config.order.name {
        let store = OrderStore::postgres(pool);
        let order_service = Arc::new(OrderService::new(store.clone(), metrics.clone()));
        let relay = OutboxRelay::new(
            store,
            EventPublisher::kafka(&config.broker_host, &config.order_topic)?,
            config.relay_batch_size,
            metrics.clone(),
        );
        tasks.push(spawn_relay(relay, config, &shutdown));
        tasks.push(spawn_consumer(
            TopicConsumer::kafka(&config.broker_host, &config.order_bill_topic, &svc.name)?,
            BillHandler::new(order_service),
            &shutdown,
        ));
    } else if svc.name == config.inventory.name {
        let store = InventoryStore::postgres(pool);
        let inventory_service = Arc::new(InventoryService::new(store.clone(), metrics.clone()));
        let relay = OutboxRelay::new(
            store,
            EventPublisher::kafka(&config.broker_host, &config.prepared_inventory_topic)?,
            config.relay_batch_size,
            metrics.clone(),
        );
        tasks.push(spawn_relay(relay, config, &shutdown));
        tasks.push(spawn_consumer(
            TopicConsumer::kafka(&config.broker_host, &config.order_topic, &svc.name)?,
            PrepareHandler::new(inventory_service.clone()),
            &shutdown,
        ));
        tasks.push(spawn_consumer(
            TopicConsumer::kafka(&config.broker_host, &config.order_bill_topic, &svc.name)?,
            RestoreHandler::new(inventory_service),
            &shutdown,
        ));
    } else if svc.name == config.payment.name {
        let store = PaymentStore::postgres(pool);
        let payment_service = Arc::new(PaymentService::new(store.clone(), metrics.clone()));
        let relay = OutboxRelay::new(
            store,
            EventPublisher::kafka(&config.broker_host, &config.order_bill_topic)?,
            config.relay_batch_size,
            metrics.clone(),
        );
        tasks.push(spawn_relay(relay, config, &shutdown));
        tasks.push(spawn_consumer(
            TopicConsumer::kafka(
                &config.broker_host,
                &config.prepared_inventory_topic,
                &svc.name,
            )?,
            PayHandler::new(payment_service),
            &shutdown,
        ));
    }

    info!(service = %svc.name, "service started");

    let ops = OpsServer::new(config.metrics_port, registry);
    ops.start(shutdown.clone()).await?;

    for task in tasks {
        task.await.ok();
    }
    info!(service = %svc.name, "service stopped");
    Ok(())
}

fn spawn_relay<Q>(
    relay: OutboxRelay<Q>,
    config: &AppConfig,
    shutdown: &Arc<Notify>,
) -> JoinHandle<()>
where
    Q: repository::OutboxQueue + 'static,
{
    let interval = config.relay_interval;
    let shutdown = shutdown.clone();
    tokio::spawn(async move { relay.run(interval, shutdown).await })
}

fn spawn_consumer<H>(consumer: TopicConsumer, handler: H, shutdown: &Arc<Notify>) -> JoinHandle<()>
where
    H: EventHandler + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = consumer.run(&handler, shutdown).await {
            error!("consumer stopped: {e}");
        }
    })
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
