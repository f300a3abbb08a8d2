//! Consumer dispatch: per-queue handlers with in-place retry and dead-lettering.
//!
//! Handlers are registered explicitly per queue in a [`HandlerRegistry`].
//! [`ConsumerDispatcher`] runs one worker per registered queue; each delivery
//! goes through the state machine in [`QueueWorker::process_delivery`]:
//!
//! ```text
//! RECEIVED -> HANDLING -> ACKED
//!                |   ^
//!                v   |
//!          RETRY_SCHEDULED        (attempt < max_attempts)
//!                |
//!                v
//!          DEAD_LETTERED          (attempt == max_attempts, via Recoverer)
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::BusError;
use crate::event::OutcomeEvent;

mod dispatcher;
mod worker;

pub use dispatcher::{ConsumerDispatcher, DispatcherHandle, WorkerSummary};
pub use worker::{DeliveryAttempt, DeliveryOutcome, DeliveryState, QueueWorker};

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from building or starting the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("A handler is already registered for queue '{0}'")]
    DuplicateHandler(String),

    #[error("No handlers registered")]
    NoHandlers,

    #[error("Invalid retry policy for queue '{queue}': {reason}")]
    InvalidRetryPolicy { queue: String, reason: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A handler panicked instead of returning an error. Counts as a failed attempt.
#[derive(Debug, thiserror::Error)]
#[error("Handler panicked: {0}")]
pub struct HandlerPanic(pub String);

impl HandlerPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self(message)
    }
}

/// Why a body could not be turned into a [`PaymentMessage`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body is JSON but not an object")]
    NotAnObject,
}

/// A delivered message as seen by a handler.
///
/// The body is kept as a loose key/value map so unknown or extra fields never
/// break decoding.
#[derive(Debug, Clone)]
pub struct PaymentMessage {
    pub fields: Map<String, Value>,
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Handler invocation number for this delivery, starting at 1.
    pub attempt: u32,
}

impl PaymentMessage {
    /// Decode a wire body into a JSON object map.
    pub fn decode(body: &[u8]) -> Result<Map<String, Value>, DecodeError> {
        match serde_json::from_slice(body)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn order_id(&self) -> Option<&str> {
        self.str_field("orderId")
    }

    pub fn payment_status(&self) -> Option<&str> {
        self.str_field("paymentStatus")
    }

    /// `true` for retries of the same delivery.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Strict view of the message as an outcome event.
    pub fn to_outcome(&self) -> Result<OutcomeEvent, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

/// Business handler for one queue.
///
/// Returning `Ok` acknowledges the delivery; an `Err` schedules a retry or,
/// once attempts are exhausted, dead-letters it.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<PaymentMessage>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&PaymentMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: Arc<PaymentMessage>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let result = (self.0)(&message);
        Box::pin(futures::future::ready(result))
    }
}

/// Wrap a synchronous closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&PaymentMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Queue name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        let queue = queue.into();
        if self.handlers.contains_key(&queue) {
            return Err(DispatchError::DuplicateHandler(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Retry settings for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Handler invocations per delivery, including the first.
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub multiplier: f32,
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 5000,
            multiplier: 1.0,
            max_interval_ms: 10000,
        }
    }
}

/// Validated retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f32,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(queue: &str, config: &RetryConfig) -> Result<Self, DispatchError> {
        let invalid = |reason: &str| DispatchError::InvalidRetryPolicy {
            queue: queue.to_string(),
            reason: reason.to_string(),
        };

        if config.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            return Err(invalid("multiplier must be >= 1.0"));
        }
        if config.initial_interval_ms > config.max_interval_ms {
            return Err(invalid("initial_interval_ms exceeds max_interval_ms"));
        }

        Ok(Self {
            max_attempts: config.max_attempts,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
        })
    }

    /// Delays between handler invocations, one per retry.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_interval)
            .with_max_delay(self.max_interval)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(5),
            multiplier: 1.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

/// Consumer settings for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConsumerConfig {
    /// Deliveries handled in parallel.
    pub concurrency: usize,
    /// Unacknowledged deliveries the broker may push. Defaults to `concurrency`.
    pub prefetch: Option<u16>,
    pub retry: RetryConfig,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            prefetch: None,
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConsumerConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch.unwrap_or_else(|| {
            u16::try_from(self.effective_concurrency()).unwrap_or(u16::MAX)
        })
    }
}

/// Consumer settings for both work queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumersConfig {
    pub success: QueueConsumerConfig,
    pub failed: QueueConsumerConfig,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_grace_secs: u64,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            success: QueueConsumerConfig::default(),
            failed: QueueConsumerConfig::default(),
            shutdown_grace_secs: 30,
        }
    }
}

impl ConsumersConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
