// tests/dispatch_test.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use queue_bus::bus::{BusError, CollectingErrorSink, HandlerBinding, HandlerSpec, QueueBus};
use queue_bus::messaging::{InMemoryTransport, Message, ReceivedMessage, ReceiverHandle, Transport};
use queue_bus::{handler_fn, BusConfig};

fn recording(owner: &str, method: &str, seen: Arc<Mutex<Vec<String>>>) -> HandlerBinding {
    let label = method.to_string();
    HandlerBinding::new(
        owner,
        method,
        handler_fn(move |_message: ReceivedMessage, _receiver: ReceiverHandle| {
            let seen = seen.clone();
            let label = label.clone();
            async move {
                seen.lock().unwrap().push(label);
                Ok(())
            }
        }),
    )
}

fn bus(transport: &Arc<InMemoryTransport>, sink: &Arc<CollectingErrorSink>) -> QueueBus {
    QueueBus::with_error_sink(transport.clone(), BusConfig::new("memory://test"), sink.clone())
}

async fn wait_for_dispatch() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn single_handler_queue_end_to_end() {
    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = bus(&transport, &sink);
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.start(vec![HandlerSpec::queue(
        "ORDERS",
        "CREATE",
        recording("OrdersController", "create", seen.clone()),
    )])
    .await
    .unwrap();

    assert!(transport.has_queue("ORDERS.CREATE"));
    assert_eq!(transport.create_queue_calls("ORDERS.CREATE"), 1);

    // No type tag at all: single mode never looks one up.
    transport
        .deliver("ORDERS.CREATE", Message::new(r#"{"id": 1}"#))
        .unwrap();
    wait_for_dispatch().await;

    assert_eq!(*seen.lock().unwrap(), vec!["create".to_string()]);
    assert!(sink.is_empty());
    assert_eq!(transport.completed("ORDERS.CREATE").len(), 1);
}

#[tokio::test]
async fn typed_queue_routes_by_message_type() {
    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = bus(&transport, &sink);
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.start(vec![
        HandlerSpec::message_type("ORDERS", "PLACED", recording("OrdersController", "placed", seen.clone())),
        HandlerSpec::message_type("ORDERS", "CANCELLED", recording("OrdersController", "cancelled", seen.clone())),
    ])
    .await
    .unwrap();

    transport
        .deliver("ORDERS", Message::new("{}").with_property("messageType", "CANCELLED"))
        .unwrap();
    wait_for_dispatch().await;
    assert_eq!(*seen.lock().unwrap(), vec!["cancelled".to_string()]);

    let shipped = Message::new("{}").with_property("messageType", "SHIPPED");
    let shipped_id = shipped.message_id.clone();
    transport.deliver("ORDERS", shipped).unwrap();
    wait_for_dispatch().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].queue, "ORDERS");
    assert_eq!(failures[0].message_id.as_deref(), Some(shipped_id.as_str()));
    assert!(matches!(
        failures[0].error,
        BusError::UnknownMessageType { ref message_type, .. } if message_type.as_deref() == Some("SHIPPED")
    ));
    assert_eq!(transport.abandoned("ORDERS"), vec![shipped_id]);
}

#[tokio::test]
async fn unknown_type_does_not_stop_the_subscription() {
    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = bus(&transport, &sink);
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.start(vec![HandlerSpec::message_type(
        "ORDERS",
        "PLACED",
        recording("OrdersController", "placed", seen.clone()),
    )])
    .await
    .unwrap();

    // Untagged first, then unknown, then a known tag.
    transport.deliver("ORDERS", Message::new("untagged")).unwrap();
    wait_for_dispatch().await;
    transport
        .deliver("ORDERS", Message::new("x").with_property("messageType", "REFUNDED"))
        .unwrap();
    wait_for_dispatch().await;
    transport
        .deliver("ORDERS", Message::new("y").with_property("messageType", "PLACED"))
        .unwrap();
    wait_for_dispatch().await;

    assert_eq!(*seen.lock().unwrap(), vec!["placed".to_string()]);
    let failures = sink.take();
    assert_eq!(failures.len(), 2);
    assert!(matches!(
        failures[0].error,
        BusError::UnknownMessageType { message_type: None, .. }
    ));
}

#[tokio::test]
async fn non_string_tag_is_an_unknown_type() {
    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = bus(&transport, &sink);
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.start(vec![HandlerSpec::message_type(
        "ORDERS",
        "1",
        recording("OrdersController", "numeric", seen.clone()),
    )])
    .await
    .unwrap();

    transport
        .deliver("ORDERS", Message::new("{}").with_property("messageType", 1i64))
        .unwrap();
    wait_for_dispatch().await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn custom_message_type_property_is_honoured() {
    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = QueueBus::with_error_sink(
        transport.clone(),
        BusConfig::new("memory://test").with_message_type_property("kind"),
        sink.clone(),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.start(vec![HandlerSpec::message_type(
        "BILLING",
        "CHARGE",
        recording("BillingController", "charge", seen.clone()),
    )])
    .await
    .unwrap();

    let sender = bus.get_typed_sender("BILLING", "CHARGE").await.unwrap();
    sender.send(Message::new("{}")).await.unwrap();
    wait_for_dispatch().await;

    assert_eq!(*seen.lock().unwrap(), vec!["charge".to_string()]);
    let sent = transport.sent_messages("BILLING");
    assert_eq!(sent[0].property("kind").and_then(|v| v.as_str()), Some("CHARGE"));
    assert!(sent[0].property("messageType").is_none());
}

#[tokio::test]
async fn concurrent_calls_are_bounded_by_options() {
    use queue_bus::config::QueueOptions;
    use queue_bus::messaging::SubscribeOptions;

    let transport = Arc::new(InMemoryTransport::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let bus = bus(&transport, &sink);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (flight, top) = (in_flight.clone(), peak.clone());
    let binding = HandlerBinding::new(
        "SlowController",
        "handle",
        handler_fn(move |_m: ReceivedMessage, _r: ReceiverHandle| {
            let (flight, top) = (flight.clone(), top.clone());
            async move {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                top.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    let options = QueueOptions {
        receiver_options: None,
        subscribe_options: Some(SubscribeOptions {
            auto_complete_messages: true,
            max_concurrent_calls: 2,
        }),
    };

    bus.start(vec![HandlerSpec::queue("", "SLOW", binding).with_options(options)])
        .await
        .unwrap();
    for i in 0..6 {
        transport.deliver("SLOW", Message::new(format!("{}", i))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.completed("SLOW").len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(transport.queue_exists("SLOW").await.unwrap());
}
