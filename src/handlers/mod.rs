//! Built-in handlers for the two outcome queues.
//!
//! Both log the decoded message; real business work (order status updates,
//! notifications, alerts) registers its own [`MessageHandler`] instead.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::dispatch::{
    DispatchError, HandlerError, HandlerRegistry, MessageHandler, PaymentMessage,
};
use crate::topology::TopologyConfig;

/// Which outcome queue a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failed,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error raised when failure simulation is on.
#[derive(Debug, thiserror::Error)]
#[error("Simulated processing failure")]
pub struct SimulatedFailure;

/// Logs each message, first attempt and retries distinguished.
pub struct LoggingHandler {
    kind: OutcomeKind,
    simulate_failure: bool,
}

impl LoggingHandler {
    pub fn new(kind: OutcomeKind) -> Self {
        Self {
            kind,
            simulate_failure: false,
        }
    }

    /// Fail every invocation, to exercise retry and dead-lettering.
    pub fn with_simulated_failure(mut self, simulate: bool) -> Self {
        self.simulate_failure = simulate;
        self
    }
}

impl MessageHandler for LoggingHandler {
    fn handle(&self, message: Arc<PaymentMessage>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let body = Value::Object(message.fields.clone());
        if message.is_retry() {
            info!(
                outcome = %self.kind,
                retry_count = message.attempt - 1,
                order_id = message.order_id().unwrap_or("-"),
                message = %body,
                "Retrying message processing"
            );
        } else {
            info!(
                outcome = %self.kind,
                order_id = message.order_id().unwrap_or("-"),
                message = %body,
                "Processing message for the first time"
            );
        }

        let result: Result<(), HandlerError> = if self.simulate_failure {
            info!(outcome = %self.kind, "Simulating processing failure");
            Err(Box::new(SimulatedFailure))
        } else {
            Ok(())
        };
        Box::pin(futures::future::ready(result))
    }
}

/// Registry with logging handlers on the configured success and failed queues.
pub fn default_registry(
    topology: &TopologyConfig,
    simulate_failure: bool,
) -> Result<HandlerRegistry, DispatchError> {
    let mut registry = HandlerRegistry::new();
    registry.register(
        topology.success_queue.clone(),
        Arc::new(LoggingHandler::new(OutcomeKind::Success).with_simulated_failure(simulate_failure)),
    )?;
    registry.register(
        topology.failed_queue.clone(),
        Arc::new(LoggingHandler::new(OutcomeKind::Failed).with_simulated_failure(simulate_failure)),
    )?;
    Ok(registry)
}
