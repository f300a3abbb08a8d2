use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use super::*;
use crate::bus::{InMemoryBroker, Result as BusResult, ReturnedMessage};
use crate::event::{MethodDetails, NewOutcome, PaymentMethod, PaymentStatus};
use crate::topology::{declare, BrokerTopology, TopologyConfig};

enum Step {
    Unreachable,
    Confirm(BrokerConfirm),
    Hang,
}

/// Transport that plays back a fixed sequence of send results.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    sends: AtomicUsize,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            sends: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _message: OutboundMessage) -> BusResult<PendingConfirm> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Confirm(BrokerConfirm::Ack));
        match step {
            Step::Unreachable => Err(BusError::Connection("connection refused".to_string())),
            Step::Confirm(confirm) => Ok(Box::pin(futures::future::ready(Ok::<_, BusError>(confirm)))),
            Step::Hang => Ok(Box::pin(futures::future::pending::<BusResult<BrokerConfirm>>())),
        }
    }
}

fn outcome(status: PaymentStatus) -> OutcomeEvent {
    OutcomeEvent::new(NewOutcome {
        order_id: "ORD1".to_string(),
        amount: dec!(25.00),
        currency: "USD".to_string(),
        payment_method: PaymentMethod::Paypal,
        payment_status: status,
        details: MethodDetails::paypal("buyer@example.com"),
        transaction_id: if status == PaymentStatus::Success {
            "TXN-1".to_string()
        } else {
            String::new()
        },
        retry_count: 0,
    })
    .unwrap()
}

async fn memory_broker() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    declare(
        broker.as_ref(),
        &BrokerTopology::order_payment(&TopologyConfig::default()),
    )
    .await
    .unwrap();
    broker
}

#[tokio::test]
async fn test_publish_delivers_and_confirms() {
    let broker = memory_broker().await;
    let (publisher, mut signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let event = outcome(PaymentStatus::Success);

    let receipt = publisher
        .publish(&TopologyConfig::default().success_target(), &event)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 1);
    assert_eq!(receipt.message_id, event.id.to_string());
    assert_eq!(broker.queue_depth("order.payment.success.queue"), Some(1));

    let confirm = signals.confirms.recv().await.unwrap();
    assert_eq!(confirm.outcome, ConfirmOutcome::Ack);
    assert_eq!(confirm.message_id, event.id.to_string());
    let sent: OutcomeEvent = serde_json::from_slice(&confirm.payload).unwrap();
    assert_eq!(sent, event);
}

#[tokio::test]
async fn test_publish_outcome_routes_by_status() {
    let broker = memory_broker().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let routes = OutcomeRoutes::default();

    publisher
        .publish_outcome(&routes, &outcome(PaymentStatus::Failed))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("order.payment.failed.queue"), Some(1));
    assert_eq!(broker.queue_depth("order.payment.success.queue"), Some(0));
}

#[tokio::test]
async fn test_publish_notice_uses_failed_route() {
    let broker = memory_broker().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());

    publisher
        .publish_notice(
            &TopologyConfig::default().failed_target(),
            &FailureNotice::new("card declined"),
        )
        .await
        .unwrap();

    let ready = broker.ready_messages("order.payment.failed.queue");
    assert_eq!(ready.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&ready[0].body).unwrap();
    assert_eq!(body["message"], "card declined");
    assert!(body.get("createdAt").is_some());
}

#[tokio::test]
async fn test_unroutable_publish_raises_return_signal() {
    let broker = memory_broker().await;
    let (publisher, mut signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let target = RoutingTarget::new("order.payment.exchange", "order.payment.refunded");

    publisher
        .publish(&target, &outcome(PaymentStatus::Success))
        .await
        .unwrap();

    let returned = signals.returns.recv().await.unwrap();
    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.reason, ReturnReason::NoBinding);
    assert_eq!(returned.routing_key, "order.payment.refunded");
    assert_eq!(signals.confirms.recv().await.unwrap().outcome, ConfirmOutcome::Ack);
    assert_eq!(broker.queue_depth("order.payment.success.queue"), Some(0));
    assert_eq!(broker.queue_depth("order.payment.failed.queue"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_exhausts_three_attempts() {
    let broker = memory_broker().await;
    broker.set_reachable(false);
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());

    let started = tokio::time::Instant::now();
    let err = publisher
        .publish(
            &TopologyConfig::default().success_target(),
            &outcome(PaymentStatus::Success),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        PublishError::Exhausted {
            attempts: 3,
            source: BusError::Connection(_)
        }
    ));
    assert_eq!(broker.send_attempts(), 3);
    assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(11), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_send_recovers_on_second_attempt() {
    let transport = ScriptedTransport::new(vec![Step::Unreachable]);
    let (publisher, _signals) = Publisher::new(transport.clone(), PublisherConfig::default());

    let receipt = publisher
        .publish(
            &TopologyConfig::default().success_target(),
            &outcome(PaymentStatus::Success),
        )
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(transport.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_nack_is_reported_and_not_retried() {
    let transport = ScriptedTransport::new(vec![Step::Confirm(BrokerConfirm::Nack {
        cause: Some("internal error".to_string()),
    })]);
    let (publisher, mut signals) = Publisher::new(transport.clone(), PublisherConfig::default());

    publisher
        .publish(
            &TopologyConfig::default().success_target(),
            &outcome(PaymentStatus::Success),
        )
        .await
        .unwrap();

    let confirm = signals.confirms.recv().await.unwrap();
    assert_eq!(
        confirm.outcome,
        ConfirmOutcome::Nack {
            cause: Some("internal error".to_string())
        }
    );
    assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_confirm_times_out() {
    let transport = ScriptedTransport::new(vec![Step::Hang]);
    let (publisher, mut signals) = Publisher::new(transport, PublisherConfig::default());

    publisher
        .publish(
            &TopologyConfig::default().success_target(),
            &outcome(PaymentStatus::Success),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let confirm = signals.confirms.recv().await.unwrap();
    assert_eq!(confirm.outcome, ConfirmOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test]
async fn test_invalid_target_is_rejected_without_sending() {
    let transport = ScriptedTransport::new(vec![]);
    let (publisher, _signals) = Publisher::new(transport.clone(), PublisherConfig::default());

    let err = publisher
        .publish(
            &RoutingTarget::new("", "order.payment.success"),
            &outcome(PaymentStatus::Success),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::InvalidTarget(_)));
    assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mutated_event_is_revalidated_before_sending() {
    let broker = memory_broker().await;
    let (publisher, _signals) = Publisher::new(broker.clone(), PublisherConfig::default());
    let routes = OutcomeRoutes::default();

    let mut missing_txn = outcome(PaymentStatus::Success);
    missing_txn.transaction_id = String::new();
    let err = publisher
        .publish_outcome(&routes, &missing_txn)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::InvalidEvent(EventError::MissingTransactionId)
    ));

    let mut negative = outcome(PaymentStatus::Success);
    negative.amount = dec!(-5);
    let err = publisher.publish_outcome(&routes, &negative).await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::InvalidEvent(EventError::NonPositiveAmount(_))
    ));

    assert_eq!(broker.send_attempts(), 0);
    assert_eq!(broker.queue_depth("order.payment.success.queue"), Some(0));
}

#[tokio::test]
async fn test_monitor_counts_signals_until_publisher_dropped() {
    let transport = ScriptedTransport::new(vec![
        Step::Confirm(BrokerConfirm::Ack),
        Step::Confirm(BrokerConfirm::Nack { cause: None }),
        Step::Confirm(BrokerConfirm::Returned(ReturnedMessage {
            reply_code: 403,
            reply_text: "ACCESS_REFUSED".to_string(),
            exchange: "order.payment.exchange".to_string(),
            routing_key: "order.payment.success".to_string(),
            message_id: None,
            payload: Bytes::from_static(b"{}"),
        })),
    ]);
    let (publisher, signals) = Publisher::new(transport, PublisherConfig::default());
    let monitor = signals.spawn_monitor();
    let target = TopologyConfig::default().success_target();

    for _ in 0..3 {
        publisher
            .publish(&target, &outcome(PaymentStatus::Success))
            .await
            .unwrap();
    }
    drop(publisher);

    let summary = monitor.await.unwrap();
    assert_eq!(
        summary,
        MonitorSummary {
            acked: 2,
            nacked: 1,
            timed_out: 0,
            returned: 1,
        }
    );
}

#[test]
fn test_return_reason_taxonomy() {
    assert_eq!(ReturnReason::from_code(311), ReturnReason::SizeExceeded);
    assert_eq!(ReturnReason::from_code(312), ReturnReason::NoBinding);
    assert_eq!(ReturnReason::from_code(320), ReturnReason::ConnectionClosing);
    assert_eq!(ReturnReason::from_code(403), ReturnReason::PermissionDenied);
    assert_eq!(ReturnReason::from_code(405), ReturnReason::ResourceLocked);
    assert_eq!(ReturnReason::from_code(541), ReturnReason::BrokerInternalError);
    assert_eq!(ReturnReason::from_code(999), ReturnReason::Unknown(999));

    assert!(ReturnReason::NoBinding.is_soft());
    assert!(!ReturnReason::PermissionDenied.is_soft());
    assert_eq!(ReturnReason::Unknown(999).to_string(), "unknown(999)");
}

#[test]
fn test_publisher_config_defaults() {
    let config = PublisherConfig::default();
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.retry_delay(), Duration::from_secs(5));
    assert_eq!(config.confirm_timeout(), Duration::from_secs(5));
    assert!(config.mandatory);
}
