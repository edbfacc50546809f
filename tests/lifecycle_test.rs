// tests/lifecycle_test.rs
use std::sync::Arc;

use queue_bus::bus::{
    BusError, CollectingErrorSink, ConnectionState, HandlerBinding, HandlerSpec, PoolEntry, QueueBus,
};
use queue_bus::config::MessageTypeSenders;
use queue_bus::messaging::{InMemoryTransport, ReceivedMessage, ReceiverHandle, TransportError};
use queue_bus::{handler_fn, BusConfig};

fn noop(owner: &str, method: &str) -> HandlerBinding {
    HandlerBinding::new(
        owner,
        method,
        handler_fn(|_m: ReceivedMessage, _r: ReceiverHandle| async { Ok(()) }),
    )
}

fn new_bus(transport: &Arc<InMemoryTransport>, config: BusConfig) -> QueueBus {
    QueueBus::with_error_sink(transport.clone(), config, Arc::new(CollectingErrorSink::new()))
}

#[tokio::test]
async fn configuration_errors_abort_startup() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test"));

    let err = bus
        .start(vec![
            HandlerSpec::queue("ORDERS", "CREATE", noop("OrdersController", "create")),
            HandlerSpec::queue("ORDERS", "CREATE", noop("OrdersController", "create_again")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Conflict { ref queue, .. } if queue == "ORDERS.CREATE"));
    assert!(err.is_configuration_error());

    // Nothing was provisioned: collection fails before any connect.
    assert_eq!(transport.queue_exists_calls("ORDERS.CREATE"), 0);
    assert!(bus.pool().is_empty());
}

#[tokio::test]
async fn mixing_modes_on_one_queue_is_rejected() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test"));

    let err = bus
        .start(vec![
            HandlerSpec::queue("", "PAYMENTS", noop("PaymentsController", "all")),
            HandlerSpec::message_type("PAYMENTS", "REFUND", noop("PaymentsController", "refund")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ModeConflict { ref queue } if queue == "PAYMENTS"));
}

#[tokio::test]
async fn separator_comes_from_config() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test").with_separator("/"));

    bus.start(vec![HandlerSpec::queue(
        "SERVICE-A",
        "APPROVE-ENTITY",
        noop("EntityController", "approve"),
    )])
    .await
    .unwrap();

    assert!(transport.has_queue("SERVICE-A/APPROVE-ENTITY"));
    assert_eq!(bus.pool().names(), vec!["SERVICE-A/APPROVE-ENTITY".to_string()]);
}

#[tokio::test]
async fn connected_queue_rejects_reconnect_and_late_registration() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test"));
    bus.start(vec![HandlerSpec::message_type(
        "ORDERS",
        "PLACED",
        noop("OrdersController", "placed"),
    )])
    .await
    .unwrap();

    let connection = bus.connection("ORDERS").unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(matches!(connection.connect().await, Err(BusError::AlreadyConnected(_))));
    assert!(matches!(
        connection.register_typed("CANCELLED", noop("OrdersController", "cancelled")),
        Err(BusError::AlreadyConnected(_))
    ));
    assert_eq!(transport.create_queue_calls("ORDERS"), 1);
    assert_eq!(transport.queue_exists_calls("ORDERS"), 1);
}

#[tokio::test]
async fn registering_a_pooled_queue_again_is_a_duplicate() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test"));
    bus.register_all(vec![HandlerSpec::queue("", "Q", noop("A", "handle"))])
        .await
        .unwrap();

    let err = bus
        .register_all(vec![HandlerSpec::queue("", "Q", noop("B", "handle"))])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::DuplicateKey(ref q) if q == "Q"));
    assert_eq!(transport.create_receiver_calls("Q"), 1);
}

#[tokio::test]
async fn provisioning_failure_surfaces_from_start() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_create_queue("BAD NAME", TransportError::Unknown("invalid queue name".into()));
    let bus = new_bus(&transport, BusConfig::new("memory://test"));

    let err = bus
        .start(vec![HandlerSpec::queue("", "BAD NAME", noop("A", "handle"))])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::QueueProvisioning { ref queue, .. } if queue == "BAD NAME"));
    assert!(!err.is_configuration_error());
    assert!(!bus.pool().contains("BAD NAME"));
}

#[tokio::test]
async fn failed_start_releases_earlier_queues_and_can_be_retried() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_create_queue("B", TransportError::Unknown("quota exceeded".into()));
    let bus = new_bus(&transport, BusConfig::new("memory://test"));
    let specs = || {
        vec![
            HandlerSpec::queue("", "A", noop("A", "handle")),
            HandlerSpec::message_type("B", "PING", noop("B", "ping")),
        ]
    };

    let err = bus.start(specs()).await.unwrap_err();
    assert!(matches!(err, BusError::QueueProvisioning { ref queue, .. } if queue == "B"));
    assert!(bus.pool().is_empty());

    transport.clear_failures();
    bus.start(specs()).await.unwrap();
    assert_eq!(bus.pool().names(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(bus.connection("A").unwrap().state(), ConnectionState::Connected);
    assert_eq!(transport.create_receiver_calls("A"), 2);

    // The retried subscription on A is live.
    bus.get_queue_sender("A")
        .await
        .unwrap()
        .send(queue_bus::Message::new("after retry"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(transport.completed("A").len(), 1);
}

#[tokio::test]
async fn configured_typed_senders_obey_the_registered_tag_rule() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut config = BusConfig::new("memory://test");
    config.message_type_senders = vec![MessageTypeSenders {
        queue: "ORDERS".to_string(),
        message_types: vec!["SHIPPED".to_string()],
    }];
    let bus = new_bus(&transport, config);
    let specs = || vec![HandlerSpec::message_type("ORDERS", "PLACED", noop("OrdersController", "placed"))];

    bus.register_all(specs()).await.unwrap();
    assert!(matches!(
        bus.provision_senders().await,
        Err(BusError::UnknownMessageType { ref message_type, .. }) if message_type.as_deref() == Some("SHIPPED")
    ));
    // Nothing was cached for the rejected tag.
    assert!(matches!(
        bus.get_typed_sender("ORDERS", "SHIPPED").await,
        Err(BusError::UnknownMessageType { .. })
    ));

    // Through `start`, the same failure leaves nothing behind.
    let other_transport = Arc::new(InMemoryTransport::new());
    let fresh = new_bus(&other_transport, bus.config().clone());
    let err = fresh.start(specs()).await.unwrap_err();
    assert!(matches!(err, BusError::UnknownMessageType { .. }));
    assert!(!fresh.pool().contains("ORDERS"));
}

#[tokio::test]
async fn configured_senders_are_provisioned_at_start() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut config = BusConfig::new("memory://test");
    config.queue_senders = vec!["AUDIT".to_string(), "ORDERS".to_string()];
    config.message_type_senders = vec![MessageTypeSenders {
        queue: "SHIPPING".to_string(),
        message_types: vec!["DISPATCHED".to_string(), "DELIVERED".to_string()],
    }];
    let bus = new_bus(&transport, config);

    bus.start(vec![HandlerSpec::message_type(
        "ORDERS",
        "PLACED",
        noop("OrdersController", "placed"),
    )])
    .await
    .unwrap();

    assert!(matches!(bus.pool().get("AUDIT"), Ok(PoolEntry::PureSender(_))));
    assert!(matches!(bus.pool().get("SHIPPING"), Ok(PoolEntry::PureSender(_))));
    // The consumed queue keeps its connection entry and its single sender.
    assert!(matches!(bus.pool().get("ORDERS"), Ok(PoolEntry::QueueConnection(_))));
    assert_eq!(transport.create_sender_calls("ORDERS"), 1);
    assert_eq!(transport.create_sender_calls("SHIPPING"), 1);

    let delivered = bus.get_typed_sender("SHIPPING", "DELIVERED").await.unwrap();
    assert_eq!(delivered.message_type(), "DELIVERED");
    assert_eq!(transport.create_sender_calls("SHIPPING"), 1);
}

#[tokio::test]
async fn shutdown_closes_everything_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let bus = new_bus(&transport, BusConfig::new("memory://test"));
    bus.start(vec![
        HandlerSpec::queue("ORDERS", "CREATE", noop("OrdersController", "create")),
        HandlerSpec::message_type("ORDERS", "PLACED", noop("OrdersController", "placed")),
    ])
    .await
    .unwrap();
    let sender = bus.get_queue_sender("AUDIT").await.unwrap();
    let connection = bus.connection("ORDERS.CREATE").unwrap();

    bus.shutdown().await.unwrap();

    assert!(bus.is_shut_down());
    assert!(transport.is_closed());
    assert!(bus.pool().is_empty());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(connection.connect().await, Err(BusError::ConnectionClosed(_))));
    assert!(sender.send(queue_bus::Message::new("late")).await.is_err());
    assert!(matches!(
        bus.get_queue_sender("AUDIT").await,
        Err(BusError::ConnectionClosed(_))
    ));

    bus.shutdown().await.unwrap();
}
