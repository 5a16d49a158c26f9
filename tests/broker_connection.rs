// These tests need a running RabbitMQ reachable with the RMQ_* variables
// (see `env::load`). Run with `cargo test -- --ignored`.

use rabbit_transport::rabbitmq::{ConnectionManager, PublisherOptions, RabbitPublisher};
use std::sync::Arc;

#[tokio::test]
#[ignore]
async fn test_consumer_connection_is_shared_against_live_broker() {
    let config = rabbit_transport::env::load().expect("RMQ_* variables must be set");
    let manager = ConnectionManager::new(&config);

    let first = manager.get_consumer_connection().await.unwrap();
    let second = manager.get_consumer_connection().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    manager.close().await.unwrap();
    assert!(!first.is_open());
}

#[tokio::test]
#[ignore]
async fn test_publisher_sends_once_against_live_broker() {
    let config = rabbit_transport::env::load().expect("RMQ_* variables must be set");
    let manager = ConnectionManager::new(&config);

    let mut publisher = RabbitPublisher::new(&manager, PublisherOptions::new("rabbit_transport.smoke", ""))
        .await
        .unwrap();
    publisher
        .send_message(&serde_json::json!({"smoke": true}))
        .await
        .unwrap();
    assert!(publisher.is_closed());
}
