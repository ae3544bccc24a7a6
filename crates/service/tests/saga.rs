//! End-to-end saga runs over the memory stores and in-process topics: the
//! three services wired through their relays and consumers exactly as in
//! production, minus the external brokers.

use std::sync::Arc;
use std::time::Duration;

use kafka_consumer::TopicConsumer;
use kafka_producer::{EventPublisher, MemoryTopic};
use model::{NewOrder, OrderStatus};
use repository::{InventoryStore, OrderStore, OutboxQueue, PaymentStore};
use service::{
    BillHandler, InventoryService, OrderService, OutboxRelay, PayHandler, PaymentService,
    PrepareHandler, RestoreHandler, SagaMetrics,
};

const DRAIN: Duration = Duration::from_millis(20);

struct World {
    order_store: OrderStore,
    inventory_store: InventoryStore,
    payment_store: PaymentStore,

    order_service: Arc<OrderService>,

    order_created: MemoryTopic,
    prepared_inventory: MemoryTopic,
    order_bill: MemoryTopic,

    order_relay: OutboxRelay<OrderStore>,
    inventory_relay: OutboxRelay<InventoryStore>,
    payment_relay: OutboxRelay<PaymentStore>,

    // One subscription per (service, topic) pair; Order and Inventory read
    // ORDER_BILL through separate groups with independent offsets.
    orders_consumer: TopicConsumer,
    prepared_consumer: TopicConsumer,
    bills_order_consumer: TopicConsumer,
    bills_inventory_consumer: TopicConsumer,

    prepare_handler: PrepareHandler,
    pay_handler: PayHandler,
    bill_handler: BillHandler,
    restore_handler: RestoreHandler,
}

impl World {
    fn new() -> Self {
        let metrics = Arc::new(SagaMetrics::new());

        let order_store = OrderStore::memory();
        let inventory_store = InventoryStore::memory();
        let payment_store = PaymentStore::memory();

        let order_service = Arc::new(OrderService::new(order_store.clone(), metrics.clone()));
        let inventory_service = Arc::new(InventoryService::new(
            inventory_store.clone(),
            metrics.clone(),
        ));
        let payment_service = Arc::new(PaymentService::new(payment_store.clone(), metrics.clone()));

        let order_created = MemoryTopic::new("ORDER_CREATED");
        let prepared_inventory = MemoryTopic::new("PREPARED_INVENTORY");
        let order_bill = MemoryTopic::new("ORDER_BILL");

        Self {
            order_relay: OutboxRelay::new(
                order_store.clone(),
                EventPublisher::memory(order_created.clone()),
                100,
                metrics.clone(),
            ),
            inventory_relay: OutboxRelay::new(
                inventory_store.clone(),
                EventPublisher::memory(prepared_inventory.clone()),
                100,
                metrics.clone(),
            ),
            payment_relay: OutboxRelay::new(
                payment_store.clone(),
                EventPublisher::memory(order_bill.clone()),
                100,
                metrics.clone(),
            ),

            orders_consumer: TopicConsumer::memory(order_created.clone()),
            prepared_consumer: TopicConsumer::memory(prepared_inventory.clone()),
            bills_order_consumer: TopicConsumer::memory(order_bill.clone()),
            bills_inventory_consumer: TopicConsumer::memory(order_bill.clone()),

            prepare_handler: PrepareHandler::new(inventory_service.clone()),
            pay_handler: PayHandler::new(payment_service),
            bill_handler: BillHandler::new(order_service.clone()),
            restore_handler: RestoreHandler::new(inventory_service),

            order_store,
            inventory_store,
            payment_store,
            order_service,
            order_created,
            prepared_inventory,
            order_bill,
        }
    }

    /// Pushes every in-flight event one hop further: relay each service's
    /// outbox, then drain each subscription.
    async fn step(&self) {
        self.order_relay.relay_once().await.unwrap();
        self.orders_consumer
            .drain(&self.prepare_handler, DRAIN)
            .await
            .unwrap();

        self.inventory_relay.relay_once().await.unwrap();
        self.prepared_consumer
            .drain(&self.pay_handler, DRAIN)
            .await
            .unwrap();

        self.payment_relay.relay_once().await.unwrap();
        self.bills_order_consumer
            .drain(&self.bill_handler, DRAIN)
            .await
            .unwrap();
        self.bills_inventory_consumer
            .drain(&self.restore_handler, DRAIN)
            .await
            .unwrap();
    }

    /// Runs the choreography to quiescence.
    async fn settle(&self) {
        for _ in 0..3 {
            self.step().await;
        }
    }
}

#[tokio::test]
async fn test_happy_path_bills_order() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 100).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    let order = world.order_store.get_order(id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Billed);
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        97
    );
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        85
    );
}

#[tokio::test]
async fn test_out_of_stock_fails_order_without_payment_mutation() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 2)
        .await
        .unwrap();
    world.payment_store.create_account(1, 100).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    let order = world.order_store.get_order(id).await.unwrap();
    assert_eq!(order.status, OrderStatus::OutOfStock);
    // No deduction happened and none was restored.
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        2
    );
    // The account was never touched.
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        100
    );
}

#[tokio::test]
async fn test_exceed_credit_limit_restores_reservation() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 14).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    let order = world.order_store.get_order(id).await.unwrap();
    assert_eq!(order.status, OrderStatus::ExceedCreditLimit);
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        14
    );
    // The reservation was compensated back to the initial stock.
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        100
    );
    let processed = world
        .inventory_store
        .processed_order(id)
        .await
        .unwrap()
        .unwrap();
    assert!(!processed.reserved);
}

#[tokio::test]
async fn test_duplicate_order_created_delivery_is_absorbed() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 100).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    // Redeliver the ORDER_CREATED event end to end.
    let payload = world.order_created.read_at(0).await.unwrap();
    world.order_created.append_all(&[payload]).await;
    world.settle().await;

    assert_eq!(
        world.order_store.get_order(id).await.unwrap().status,
        OrderStatus::Billed
    );
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        97
    );
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        85
    );
    // Exactly one ledger row and one produced event for the order.
    assert!(
        world
            .inventory_store
            .processed_order(id)
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(world.inventory_store.count_outboxes().await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_prepared_inventory_delivery_is_absorbed() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 100).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    // Redeliver the PREPARED_INVENTORY event.
    let payload = world.prepared_inventory.read_at(0).await.unwrap();
    world.prepared_inventory.append_all(&[payload]).await;
    world.settle().await;

    // Billed once, not twice.
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        85
    );
    assert!(
        world
            .payment_store
            .processed_order(id)
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(world.payment_store.count_outboxes().await.unwrap(), 1);
    assert_eq!(
        world.order_store.get_order(id).await.unwrap().status,
        OrderStatus::Billed
    );
}

#[tokio::test]
async fn test_relay_republish_after_crash_before_mark_done() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 100).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();

    // A relay that crashed after publishing but before marking DONE: the
    // payload reaches the topic while the outbox row stays PENDING.
    let pending = world.order_store.pending_outboxes(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    world
        .order_created
        .append_all(&[pending[0].content.clone()])
        .await;

    // The restarted relay publishes the row again and marks it.
    world.settle().await;
    assert_eq!(world.order_created.len().await, 2);
    assert!(world.order_store.pending_outboxes(10).await.unwrap().is_empty());

    // The duplicate had no extra business effect.
    assert_eq!(
        world.order_store.get_order(id).await.unwrap().status,
        OrderStatus::Billed
    );
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        97
    );
    assert_eq!(
        world.payment_store.get_account(1).await.unwrap().balance,
        85
    );
    assert_eq!(world.inventory_store.count_outboxes().await.unwrap(), 1);
}

#[tokio::test]
async fn test_bill_events_fan_out_to_both_groups() {
    let world = World::new();
    world
        .inventory_store
        .create_inventory(2, 5, 100)
        .await
        .unwrap();
    world.payment_store.create_account(1, 14).await.unwrap();

    let id = world
        .order_service
        .create_order(NewOrder {
            customer_id: 1,
            product_id: 2,
            amount: 3,
        })
        .await
        .unwrap();
    world.settle().await;

    // One bill on the topic, consumed independently by both groups: the
    // order reached its terminal status and the stock was restored.
    assert_eq!(world.order_bill.len().await, 1);
    assert_eq!(
        world.order_store.get_order(id).await.unwrap().status,
        OrderStatus::ExceedCreditLimit
    );
    assert_eq!(
        world.inventory_store.get_inventory(2).await.unwrap().amount,
        100
    );
}
