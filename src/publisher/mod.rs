//! Outcome publisher.
//!
//! Sends serialized events to the outcome exchange with the mandatory flag and
//! retries only the send itself (broker unreachable) with a fixed delay.
//! Broker confirms and returns arrive later, after `publish` has returned, and
//! are reported on two independent channels drained by [`SignalMonitor`].

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BrokerConfirm, BusError, OutboundMessage, PendingConfirm, Transport};
use crate::event::{EventError, FailureNotice, OutcomeEvent};
use crate::topology::{OutcomeRoutes, RoutingTarget};

mod monitor;

pub use monitor::{MonitorSummary, SignalMonitor};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors returned to the caller of a publish.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Invalid routing target '{0}': exchange and routing key must be non-empty")]
    InvalidTarget(RoutingTarget),

    #[error("Refusing to publish invalid outcome event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The broker could not be reached on any attempt. The message was not
    /// delivered; the caller decides whether to persist it for replay.
    #[error("Publish failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: BusError,
    },
}

/// Publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Send attempts, including the first.
    pub max_attempts: usize,
    /// Fixed delay between send attempts.
    pub retry_delay_ms: u64,
    /// How long to wait for the broker's confirm before reporting a timeout.
    pub confirm_timeout_ms: u64,
    /// Ask the broker to return unroutable messages.
    pub mandatory: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 5000,
            confirm_timeout_ms: 5000,
            mandatory: true,
        }
    }
}

impl PublisherConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

/// What the broker said about a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack { cause: Option<String> },
    TimedOut,
}

/// Confirm signal for one sent message.
#[derive(Debug, Clone)]
pub struct ConfirmSignal {
    pub message_id: String,
    pub target: RoutingTarget,
    pub outcome: ConfirmOutcome,
    pub payload: Bytes,
}

/// Why the broker returned a message, by AMQP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnReason {
    SizeExceeded,
    NoBinding,
    NoConsumers,
    ConnectionClosing,
    InvalidPath,
    PermissionDenied,
    NotFound,
    ResourceLocked,
    PreconditionFailed,
    NotAllowed,
    BrokerInternalError,
    Unknown(u16),
}

impl ReturnReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            311 => Self::SizeExceeded,
            312 => Self::NoBinding,
            313 => Self::NoConsumers,
            320 => Self::ConnectionClosing,
            402 => Self::InvalidPath,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            405 => Self::ResourceLocked,
            406 => Self::PreconditionFailed,
            530 => Self::NotAllowed,
            541 => Self::BrokerInternalError,
            other => Self::Unknown(other),
        }
    }

    /// Soft (channel-level) conditions; everything else is a hard error.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::SizeExceeded | Self::NoBinding | Self::NoConsumers | Self::ConnectionClosing
        )
    }
}

impl std::fmt::Display for ReturnReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SizeExceeded => write!(f, "size-exceeded"),
            Self::NoBinding => write!(f, "no-binding"),
            Self::NoConsumers => write!(f, "no-consumers"),
            Self::ConnectionClosing => write!(f, "connection-closing"),
            Self::InvalidPath => write!(f, "invalid-path"),
            Self::PermissionDenied => write!(f, "permission-denied"),
            Self::NotFound => write!(f, "not-found"),
            Self::ResourceLocked => write!(f, "resource-locked"),
            Self::PreconditionFailed => write!(f, "precondition-failed"),
            Self::NotAllowed => write!(f, "not-allowed"),
            Self::BrokerInternalError => write!(f, "broker-internal-error"),
            Self::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Return signal for a message the broker could not route.
#[derive(Debug, Clone)]
pub struct ReturnSignal {
    pub message_id: String,
    pub reply_code: u16,
    pub reason: ReturnReason,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

/// Result of a successful send. Confirms and returns follow on the signal
/// channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub target: RoutingTarget,
    /// Send attempts used, including the successful one.
    pub attempts: usize,
}

/// Receiving ends of the confirm and return channels.
pub struct PublisherSignals {
    pub confirms: mpsc::UnboundedReceiver<ConfirmSignal>,
    pub returns: mpsc::UnboundedReceiver<ReturnSignal>,
}

impl PublisherSignals {
    /// Run the logging/alerting task. It ends once every publisher clone and
    /// pending confirm is gone.
    pub fn spawn_monitor(self) -> JoinHandle<MonitorSummary> {
        tokio::spawn(SignalMonitor::new(self).run())
    }
}

/// Publishes outcome events and failure notices.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    config: PublisherConfig,
    confirms: mpsc::UnboundedSender<ConfirmSignal>,
    returns: mpsc::UnboundedSender<ReturnSignal>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, config: PublisherConfig) -> (Self, PublisherSignals) {
        let (confirms_tx, confirms_rx) = mpsc::unbounded_channel();
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        let publisher = Self {
            transport,
            config,
            confirms: confirms_tx,
            returns: returns_tx,
        };
        let signals = PublisherSignals {
            confirms: confirms_rx,
            returns: returns_rx,
        };
        (publisher, signals)
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish an outcome event to `target`.
    ///
    /// The event is re-validated first; its fields are public and may have
    /// changed since construction.
    pub async fn publish(
        &self,
        target: &RoutingTarget,
        event: &OutcomeEvent,
    ) -> Result<PublishReceipt, PublishError> {
        event.validate()?;
        let payload = serde_json::to_vec(event)?;
        self.send_with_retry(target, event.id.to_string(), Bytes::from(payload))
            .await
    }

    /// Publish to the route matching the event's payment status.
    pub async fn publish_outcome(
        &self,
        routes: &OutcomeRoutes,
        event: &OutcomeEvent,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish(routes.target_for(event.payment_status), event)
            .await
    }

    /// Publish a failure notice, normally to the failed route.
    pub async fn publish_notice(
        &self,
        target: &RoutingTarget,
        notice: &FailureNotice,
    ) -> Result<PublishReceipt, PublishError> {
        let payload = serde_json::to_vec(notice)?;
        self.send_with_retry(target, Uuid::new_v4().to_string(), Bytes::from(payload))
            .await
    }

    #[tracing::instrument(
        name = "publisher.publish",
        skip_all,
        fields(exchange = %target.exchange, routing_key = %target.routing_key, message_id = %message_id)
    )]
    async fn send_with_retry(
        &self,
        target: &RoutingTarget,
        message_id: String,
        payload: Bytes,
    ) -> Result<PublishReceipt, PublishError> {
        if target.exchange.is_empty() || target.routing_key.is_empty() {
            return Err(PublishError::InvalidTarget(target.clone()));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let message = OutboundMessage {
            exchange: target.exchange.clone(),
            routing_key: target.routing_key.clone(),
            payload: payload.clone(),
            message_id: message_id.clone(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            mandatory: self.config.mandatory,
        };
        let body = String::from_utf8_lossy(&payload);

        let backoff = ConstantBuilder::default()
            .with_delay(self.config.retry_delay())
            .with_max_times(max_attempts - 1)
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            let attempt = attempt + 1;
            if attempt > 1 {
                tokio::time::sleep(delay).await;
            }

            info!(attempt, max_attempts, payload = %body, "Publishing message");

            match self.transport.send(message.clone()).await {
                Ok(pending) => {
                    self.watch_confirm(pending, target.clone(), message_id.clone(), payload);
                    debug!(attempt, "Message handed to broker");
                    return Ok(PublishReceipt {
                        message_id,
                        target: target.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Publish attempt failed, broker unreachable"
                    );
                    last_error = Some(e);
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| BusError::Publish("no publish attempt was made".to_string()));
        error!(
            attempts = max_attempts,
            error = %source,
            payload = %body,
            "Publish failed, retries exhausted; message not delivered"
        );
        Err(PublishError::Exhausted {
            attempts: max_attempts,
            source,
        })
    }

    /// Resolve the broker confirm off the publish path.
    fn watch_confirm(
        &self,
        pending: PendingConfirm,
        target: RoutingTarget,
        message_id: String,
        payload: Bytes,
    ) {
        let confirms = self.confirms.clone();
        let returns = self.returns.clone();
        let timeout = self.config.confirm_timeout();

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, pending).await {
                Ok(Ok(BrokerConfirm::Ack)) => ConfirmOutcome::Ack,
                Ok(Ok(BrokerConfirm::Returned(returned))) => {
                    // The broker acks a returned message after the return.
                    let _ = returns.send(ReturnSignal {
                        message_id: returned.message_id.unwrap_or_else(|| message_id.clone()),
                        reply_code: returned.reply_code,
                        reason: ReturnReason::from_code(returned.reply_code),
                        reply_text: returned.reply_text,
                        exchange: returned.exchange,
                        routing_key: returned.routing_key,
                        payload: returned.payload,
                    });
                    ConfirmOutcome::Ack
                }
                Ok(Ok(BrokerConfirm::Nack { cause })) => ConfirmOutcome::Nack { cause },
                Ok(Err(e)) => ConfirmOutcome::Nack {
                    cause: Some(e.to_string()),
                },
                Err(_) => ConfirmOutcome::TimedOut,
            };

            let _ = confirms.send(ConfirmSignal {
                message_id,
                target,
                outcome,
                payload,
            });
        });
    }
}

#[cfg(test)]
mod tests;
