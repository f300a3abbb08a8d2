//! End-to-end delivery tests against the in-memory broker.
//!
//! Run with: cargo test --test pipeline
//!
//! Each test declares the order-payment topology, publishes through
//! [`Publisher`], and consumes through [`ConsumerDispatcher`] with the
//! production retry policy. Tokio time is paused wherever retry delays apply.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use payment_relay::bus::InMemoryBroker;
use payment_relay::dispatch::{handler_fn, ConsumerDispatcher, ConsumersConfig, HandlerRegistry};
use payment_relay::dlq::{LoggingRejectRecoverer, Recoverer};
use payment_relay::event::{MethodDetails, NewOutcome, OutcomeEvent, PaymentMethod, PaymentStatus};
use payment_relay::publisher::{PublishError, Publisher, PublisherConfig, ReturnReason};
use payment_relay::topology::{declare, BrokerTopology, RoutingTarget, TopologyConfig};
use rust_decimal_macros::dec;

const SUCCESS_QUEUE: &str = "order.payment.success.queue";
const FAILED_QUEUE: &str = "order.payment.failed.queue";
const SUCCESS_DLQ: &str = "order.payment.success.dlq";
const FAILED_DLQ: &str = "order.payment.failed.dlq";

async fn setup() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    declare(
        broker.as_ref(),
        &BrokerTopology::order_payment(&TopologyConfig::default()),
    )
    .await
    .expect("topology declared");
    broker
}

fn outcome(order_id: &str, status: PaymentStatus) -> OutcomeEvent {
    OutcomeEvent::new(NewOutcome {
        order_id: order_id.to_string(),
        amount: dec!(250000.00),
        currency: "IDR".to_string(),
        payment_method: PaymentMethod::Paypal,
        payment_status: status,
        details: MethodDetails::paypal("buyer@example.com"),
        transaction_id: if status == PaymentStatus::Success {
            format!("TXN-{}", order_id)
        } else {
            String::new()
        },
        retry_count: 0,
    })
    .expect("valid outcome")
}

fn depth(broker: &InMemoryBroker, queue: &str) -> usize {
    broker.queue_depth(queue).expect("queue declared")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Handler that fails its first `failures` calls.
fn counting_handler(
    failures: u32,
) -> (
    Arc<dyn payment_relay::dispatch::MessageHandler>,
    Arc<AtomicU32>,
) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_message| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            Err(format!("order service unavailable (call {})", call).into())
        } else {
            Ok(())
        }
    });
    (handler, calls)
}

fn start_dispatcher(
    broker: Arc<InMemoryBroker>,
    queue: &str,
    handler: Arc<dyn payment_relay::dispatch::MessageHandler>,
    recoverer: Arc<dyn Recoverer>,
) -> ConsumerDispatcher {
    let mut registry = HandlerRegistry::new();
    registry.register(queue, handler).expect("registered");
    ConsumerDispatcher::from_config(
        broker,
        registry,
        recoverer,
        &TopologyConfig::default(),
        &ConsumersConfig::default(),
    )
}

#[tokio::test]
async fn test_outcome_routed_to_exactly_one_queue() {
    let broker = setup().await;
    let routes = TopologyConfig::default().routes();
    let (publisher, signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let monitor = signals.spawn_monitor();

    publisher
        .publish_outcome(&routes, &outcome("ORD-1", PaymentStatus::Success))
        .await
        .expect("success published");
    assert_eq!(depth(&broker, SUCCESS_QUEUE), 1);
    assert_eq!(depth(&broker, FAILED_QUEUE), 0);

    publisher
        .publish_outcome(&routes, &outcome("ORD-2", PaymentStatus::Failed))
        .await
        .expect("failure published");
    assert_eq!(depth(&broker, SUCCESS_QUEUE), 1);
    assert_eq!(depth(&broker, FAILED_QUEUE), 1);
    assert_eq!(depth(&broker, SUCCESS_DLQ), 0);
    assert_eq!(depth(&broker, FAILED_DLQ), 0);

    drop(publisher);
    let summary = monitor.await.unwrap();
    assert_eq!(summary.acked, 2);
    assert_eq!(summary.returned, 0);
}

#[tokio::test]
async fn test_handled_message_is_acked_and_removed() {
    let broker = setup().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let (handler, calls) = counting_handler(0);

    let handle = start_dispatcher(
        broker.clone(),
        SUCCESS_QUEUE,
        handler,
        Arc::new(LoggingRejectRecoverer::new()),
    )
    .start()
    .await
    .unwrap();

    publisher
        .publish_outcome(
            &TopologyConfig::default().routes(),
            &outcome("ORD-3", PaymentStatus::Success),
        )
        .await
        .unwrap();

    wait_until("ack", || calls.load(Ordering::SeqCst) == 1 && depth(&broker, SUCCESS_QUEUE) == 0)
        .await;

    let summaries = handle.shutdown().await;
    assert_eq!(summaries[0].acked, 1);
    assert_eq!(summaries[0].dead_lettered, 0);
    assert_eq!(depth(&broker, SUCCESS_DLQ), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_lands_in_dlq_unchanged() {
    let broker = setup().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let (handler, calls) = counting_handler(u32::MAX);
    let (recoverer, mut records) = LoggingRejectRecoverer::with_channel();

    let handle = start_dispatcher(broker.clone(), FAILED_QUEUE, handler, Arc::new(recoverer))
        .start()
        .await
        .unwrap();

    let event = outcome("ORD-4", PaymentStatus::Failed);
    let published = serde_json::to_vec(&event).unwrap();
    let started = tokio::time::Instant::now();
    publisher
        .publish_outcome(&TopologyConfig::default().routes(), &event)
        .await
        .unwrap();

    let record = records.recv().await.expect("dead-letter record");
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(record.queue, FAILED_QUEUE);
    assert_eq!(record.retry_count, 3);
    assert!(record.rejected);
    assert_eq!(record.body.as_ref(), published.as_slice());
    assert!(record.cause_chain[0].contains("call 3"));

    let dead = broker.ready_messages(FAILED_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body.as_ref(), published.as_slice());
    assert_eq!(dead[0].death_count, 1);
    assert_eq!(depth(&broker, FAILED_QUEUE), 0);

    // Rejected without requeue: the work queue never sees it again.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(depth(&broker, FAILED_QUEUE), 0);
    assert_eq!(depth(&broker, FAILED_DLQ), 1);

    let summaries = handle.shutdown().await;
    assert_eq!(summaries[0].dead_lettered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_without_dead_lettering() {
    let broker = setup().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let (handler, calls) = counting_handler(2);

    let handle = start_dispatcher(
        broker.clone(),
        SUCCESS_QUEUE,
        handler,
        Arc::new(LoggingRejectRecoverer::new()),
    )
    .start()
    .await
    .unwrap();

    publisher
        .publish_outcome(
            &TopologyConfig::default().routes(),
            &outcome("ORD-5", PaymentStatus::Success),
        )
        .await
        .unwrap();

    wait_until("third attempt", || calls.load(Ordering::SeqCst) == 3).await;
    wait_until("ack", || depth(&broker, SUCCESS_QUEUE) == 0).await;

    let summaries = handle.shutdown().await;
    assert_eq!(summaries[0].acked, 1);
    assert_eq!(depth(&broker, SUCCESS_DLQ), 0);
}

#[tokio::test]
async fn test_unroutable_publish_is_returned() {
    let broker = setup().await;
    let (publisher, mut signals) = Publisher::new(broker.clone(), PublisherConfig::default());

    let target = RoutingTarget::new("order.payment.exchange", "order.refund.success");
    let receipt = publisher
        .publish(&target, &outcome("ORD-6", PaymentStatus::Success))
        .await
        .expect("broker accepted the publish");
    assert_eq!(receipt.attempts, 1);

    let returned = signals.returns.recv().await.expect("return signal");
    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.reason, ReturnReason::NoBinding);
    assert_eq!(returned.routing_key, "order.refund.success");
    assert_eq!(returned.message_id, receipt.message_id);

    for queue in [SUCCESS_QUEUE, FAILED_QUEUE, SUCCESS_DLQ, FAILED_DLQ] {
        assert_eq!(depth(&broker, queue), 0, "{} should be empty", queue);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_exhausts_send_attempts() {
    let broker = setup().await;
    broker.set_reachable(false);
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());

    let started = tokio::time::Instant::now();
    let err = publisher
        .publish_outcome(
            &TopologyConfig::default().routes(),
            &outcome("ORD-7", PaymentStatus::Success),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Exhausted { attempts: 3, .. }));
    assert_eq!(broker.send_attempts(), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(11), "elapsed {:?}", elapsed);

    broker.set_reachable(true);
    assert_eq!(depth(&broker, SUCCESS_QUEUE), 0);
}
