//! Per-delivery state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::{HandlerError, HandlerPanic, MessageHandler, PaymentMessage, RetryPolicy};
use crate::bus::Delivery;
use crate::dlq::{DeliveryContext, Recoverer};

/// Where a delivery is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Handling { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Acked { attempts: u32 },
    DeadLettered { attempts: u32 },
}

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded and the broker ack was sent.
    Acked { attempts: u32 },
    /// Handed to the recoverer. `attempts` is 0 when the body never decoded.
    DeadLettered { attempts: u32 },
    /// Handler succeeded but the ack failed; the broker will redeliver.
    AckFailed { attempts: u32 },
}

/// Invocation bookkeeping for one delivery.
///
/// Holds the original body for the recoverer and the error from the most
/// recent failed invocation.
#[derive(Debug)]
pub struct DeliveryAttempt {
    count: u32,
    last_error: Option<HandlerError>,
    body: Bytes,
}

impl DeliveryAttempt {
    pub fn new(body: Bytes) -> Self {
        Self {
            count: 0,
            last_error: None,
            body,
        }
    }

    /// Invocations started so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn last_error(&self) -> Option<&HandlerError> {
        self.last_error.as_ref()
    }

    /// Start the next invocation and return its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    /// Keep `error` as the latest failure and return it.
    pub fn record_failure(&mut self, error: HandlerError) -> &HandlerError {
        self.last_error.insert(error)
    }

    /// `true` once `max_attempts` invocations have been made.
    pub fn exhausted(&self, max_attempts: u32) -> bool {
        self.count >= max_attempts
    }
}

/// Runs one queue's handler against its deliveries.
#[derive(Clone)]
pub struct QueueWorker {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    recoverer: Arc<dyn Recoverer>,
}

impl QueueWorker {
    pub fn new(
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        recoverer: Arc<dyn Recoverer>,
    ) -> Self {
        Self {
            queue: queue.into(),
            handler,
            policy,
            recoverer,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive one delivery to `ACKED` or `DEAD_LETTERED`.
    ///
    /// Retries happen in place: the delivery stays unacknowledged and is not
    /// released to the queue between attempts.
    #[tracing::instrument(
        name = "dispatch.delivery",
        skip_all,
        fields(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id.as_deref().unwrap_or("-")
        )
    )]
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut delays = self.policy.backoff().build();
        let mut state = DeliveryState::Received;

        info!(
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            death_count = ?delivery.death_count,
            "Message received"
        );

        let fields = match PaymentMessage::decode(&delivery.body) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(error = %e, "Undecodable message, skipping retries");
                let context = DeliveryContext::from_delivery(&delivery, Some(0));
                self.recoverer.recover(&delivery.body, &context, &e).await;
                return DeliveryOutcome::DeadLettered { attempts: 0 };
            }
        };

        let mut tracker = DeliveryAttempt::new(delivery.body.clone());

        loop {
            state = match state {
                DeliveryState::Received => DeliveryState::Handling {
                    attempt: tracker.begin(),
                },

                DeliveryState::Handling { attempt } => {
                    if attempt == 1 {
                        info!(attempt, max_attempts, "Handling message");
                    } else {
                        info!(
                            attempt,
                            max_attempts,
                            retry_count = attempt - 1,
                            "Retrying message"
                        );
                    }

                    let message = Arc::new(PaymentMessage {
                        fields: fields.clone(),
                        queue: delivery.queue.clone(),
                        routing_key: delivery.routing_key.clone(),
                        message_id: delivery.message_id.clone(),
                        redelivered: delivery.redelivered,
                        attempt,
                    });

                    match self.invoke(message).await {
                        Ok(()) => DeliveryState::Acked { attempts: attempt },
                        Err(e) => {
                            self.after_failure(&delivery, &mut tracker, e, &mut delays)
                                .await
                        }
                    }
                }

                DeliveryState::RetryScheduled { delay, .. } => {
                    tokio::time::sleep(delay).await;
                    DeliveryState::Handling {
                        attempt: tracker.begin(),
                    }
                }

                DeliveryState::Acked { attempts } => {
                    return match delivery.acker.ack().await {
                        Ok(()) => {
                            debug!(attempts, "Message acknowledged");
                            DeliveryOutcome::Acked { attempts }
                        }
                        Err(e) => {
                            error!(attempts, error = %e, "Failed to acknowledge message");
                            DeliveryOutcome::AckFailed { attempts }
                        }
                    };
                }

                DeliveryState::DeadLettered { attempts } => {
                    return DeliveryOutcome::DeadLettered { attempts };
                }
            };
        }
    }

    /// Run the handler once. A panic, including one raised before the
    /// handler's future exists, becomes a [`HandlerPanic`] error.
    async fn invoke(&self, message: Arc<PaymentMessage>) -> Result<(), HandlerError> {
        AssertUnwindSafe(async { self.handler.handle(message).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let panic = HandlerPanic::from_payload(payload);
                error!(error = %panic, "Handler panicked");
                Err(Box::new(panic) as HandlerError)
            })
    }

    /// Schedule the next attempt, or hand the delivery to the recoverer.
    async fn after_failure(
        &self,
        delivery: &Delivery,
        tracker: &mut DeliveryAttempt,
        error: HandlerError,
        delays: &mut impl Iterator<Item = Duration>,
    ) -> DeliveryState {
        let attempt = tracker.count();
        let max_attempts = self.policy.max_attempts;

        if !tracker.exhausted(max_attempts) {
            let delay = delays.next().unwrap_or(self.policy.initial_interval);
            warn!(
                attempt,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Handler failed, retry scheduled"
            );
            tracker.record_failure(error);
            return DeliveryState::RetryScheduled { attempt, delay };
        }

        warn!(attempt, max_attempts, error = %error, "Handler failed, attempts exhausted");
        let context = DeliveryContext::from_delivery(delivery, Some(attempt));
        let body = tracker.body().clone();
        let cause = tracker.record_failure(error);
        self.recoverer.recover(&body, &context, &**cause).await;
        DeliveryState::DeadLettered { attempts: attempt }
    }
}
