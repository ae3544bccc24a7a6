use app_config::AppConfig;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.order_topic, "ORDER_CREATED");
    assert_eq!(cfg.prepared_inventory_topic, "PREPARED_INVENTORY");
    assert_eq!(cfg.order_bill_topic, "ORDER_BILL");
    assert_eq!(cfg.relay_batch_size, 100);
}

#[test]
fn test_service_lookup_by_name() {
    let cfg = AppConfig::load().unwrap();
    let inventory = cfg.service("inventory").unwrap();
    assert_eq!(inventory.migration_dir, "migrations/inventory");
    assert!(cfg.service("shipping").is_none());
}
