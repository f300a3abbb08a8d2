//! Dead letter recovery.
//!
//! The [`Recoverer`] is the terminal sink of a delivery whose handler kept
//! failing. It never redelivers: the message is rejected with
//! `requeue = false`, and the work queue's dead-letter arguments route it
//! through the DLX into the matching dead-letter queue.
//!
//! ## Log Record
//!
//! Each recovery logs, in order:
//! - the terminal-failure marker
//! - the resolved retry count ([`UNKNOWN_RETRY_COUNT`] when it cannot be read)
//! - the raw body exactly as received
//! - the cause chain
//!
//! ## Usage
//!
//! ```ignore
//! let (recoverer, mut records) = LoggingRejectRecoverer::with_channel();
//! recoverer.recover(&delivery.body, &context, &error).await;
//! ```

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::bus::{Delivery, DeliveryAcker};

/// Logged in place of a retry count that could not be determined.
///
/// Distinct from every real count, so a missing value is never reported as 0.
pub const UNKNOWN_RETRY_COUNT: i64 = -1;

/// Marker at the start of every recovery log line.
pub const TERMINAL_FAILURE_MARKER: &str = "Retries exhausted, dead-lettering message";

/// Everything the recoverer knows about the delivery besides its body.
#[derive(Clone)]
pub struct DeliveryContext {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub death_count: Option<u32>,
    /// Handler invocations made for this delivery, when known.
    pub retry_count: Option<u32>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl DeliveryContext {
    pub fn from_delivery(delivery: &Delivery, retry_count: Option<u32>) -> Self {
        Self {
            queue: delivery.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
            message_id: delivery.message_id.clone(),
            redelivered: delivery.redelivered,
            death_count: delivery.death_count,
            retry_count,
            acker: delivery.acker.clone(),
        }
    }

    /// Retry count as logged, with the sentinel standing in for "unknown".
    pub fn resolved_retry_count(&self) -> i64 {
        self.retry_count
            .map(i64::from)
            .unwrap_or(UNKNOWN_RETRY_COUNT)
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("death_count", &self.death_count)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// One dead-lettered delivery, for alerting or inspection.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    /// Handler invocations, or [`UNKNOWN_RETRY_COUNT`].
    pub retry_count: i64,
    /// Body exactly as received.
    pub body: Bytes,
    /// Outermost error first.
    pub cause_chain: Vec<String>,
    /// Whether the broker accepted the reject.
    pub rejected: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Terminal handling for deliveries that exhausted their retries.
///
/// There is no error return: whatever happens while logging, the delivery is
/// still rejected without requeue.
#[async_trait]
pub trait Recoverer: Send + Sync {
    async fn recover(
        &self,
        raw: &[u8],
        context: &DeliveryContext,
        cause: &(dyn Error + Send + Sync + 'static),
    );
}

/// Walk `source()` from the outermost error inwards.
pub fn cause_chain(cause: &(dyn Error + 'static)) -> Vec<String> {
    let mut chain = vec![cause.to_string()];
    let mut current = cause.source();
    while let Some(inner) = current {
        chain.push(inner.to_string());
        current = inner.source();
    }
    chain
}

/// Logs the failure and rejects the delivery so the broker dead-letters it.
#[derive(Default)]
pub struct LoggingRejectRecoverer {
    sink: Option<mpsc::UnboundedSender<DeadLetterRecord>>,
}

impl LoggingRejectRecoverer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward a [`DeadLetterRecord`] for every recovery.
    pub fn with_sink(sink: mpsc::UnboundedSender<DeadLetterRecord>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Recoverer plus the receiving end of its record channel.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<DeadLetterRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::with_sink(sender), receiver)
    }
}

#[async_trait]
impl Recoverer for LoggingRejectRecoverer {
    async fn recover(
        &self,
        raw: &[u8],
        context: &DeliveryContext,
        cause: &(dyn Error + Send + Sync + 'static),
    ) {
        let retry_count = context.resolved_retry_count();
        let body = String::from_utf8_lossy(raw);
        let chain = cause_chain(cause);

        error!(
            queue = %context.queue,
            routing_key = %context.routing_key,
            message_id = context.message_id.as_deref().unwrap_or("-"),
            delivery_tag = context.delivery_tag,
            "{}",
            TERMINAL_FAILURE_MARKER
        );
        if context.retry_count.is_none() {
            error!(
                queue = %context.queue,
                delivery_tag = context.delivery_tag,
                "Could not determine retry count for dead-lettered message"
            );
        }
        error!(
            queue = %context.queue,
            retry_count,
            redelivered = context.redelivered,
            death_count = ?context.death_count,
            "Retry count: {}",
            retry_count
        );
        error!(queue = %context.queue, body = %body, "Message body");
        error!(queue = %context.queue, cause = ?chain, "Cause: {}", chain.join(": "));

        let rejected = match context.acker.reject(false).await {
            Ok(()) => true,
            Err(e) => {
                // The broker redelivers it once the channel closes.
                error!(
                    queue = %context.queue,
                    delivery_tag = context.delivery_tag,
                    error = %e,
                    "Failed to reject message for dead-lettering"
                );
                false
            }
        };

        if let Some(sink) = &self.sink {
            let record = DeadLetterRecord {
                queue: context.queue.clone(),
                routing_key: context.routing_key.clone(),
                message_id: context.message_id.clone(),
                retry_count,
                body: Bytes::copy_from_slice(raw),
                cause_chain: chain,
                rejected,
                occurred_at: Utc::now(),
            };
            if sink.send(record).is_err() {
                warn!(queue = %context.queue, "Dead letter record receiver dropped");
            }
        }
    }
}
