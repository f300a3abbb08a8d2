//! Queue workers and their lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    ConsumersConfig, DeliveryOutcome, DispatchError, HandlerRegistry, QueueConsumerConfig,
    QueueWorker, RetryPolicy,
};
use crate::bus::{Broker, Consumer};
use crate::dlq::Recoverer;
use crate::topology::TopologyConfig;
use crate::utils::retry::consumer_reconnect_backoff;

/// Per-queue counts reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub queue: String,
    pub acked: usize,
    pub dead_lettered: usize,
    pub ack_failed: usize,
    /// In-flight deliveries cut off when the grace period ran out. The broker
    /// redelivers them.
    pub aborted: usize,
    pub reconnects: usize,
}

impl WorkerSummary {
    fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, joined: Result<DeliveryOutcome, JoinError>) {
        match joined {
            Ok(DeliveryOutcome::Acked { .. }) => self.acked += 1,
            Ok(DeliveryOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Ok(DeliveryOutcome::AckFailed { .. }) => self.ack_failed += 1,
            Err(e) if e.is_cancelled() => self.aborted += 1,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Delivery task panicked");
                self.aborted += 1;
            }
        }
    }
}

/// Starts one worker per registered queue.
pub struct ConsumerDispatcher {
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    recoverer: Arc<dyn Recoverer>,
    queue_configs: HashMap<String, QueueConsumerConfig>,
    shutdown_grace: Duration,
}

impl ConsumerDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        recoverer: Arc<dyn Recoverer>,
    ) -> Self {
        Self {
            broker,
            registry,
            recoverer,
            queue_configs: HashMap::new(),
            shutdown_grace: ConsumersConfig::default().shutdown_grace(),
        }
    }

    /// Dispatcher with the success/failed queue settings from configuration.
    pub fn from_config(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        recoverer: Arc<dyn Recoverer>,
        topology: &TopologyConfig,
        consumers: &ConsumersConfig,
    ) -> Self {
        Self::new(broker, registry, recoverer)
            .with_queue_config(&topology.success_queue, consumers.success.clone())
            .with_queue_config(&topology.failed_queue, consumers.failed.clone())
            .with_shutdown_grace(consumers.shutdown_grace())
    }

    pub fn with_queue_config(mut self, queue: impl Into<String>, config: QueueConsumerConfig) -> Self {
        self.queue_configs.insert(queue.into(), config);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate every queue's settings, open the consumers, and spawn the workers.
    ///
    /// Nothing is spawned if any queue fails validation or cannot be consumed.
    pub async fn start(self) -> Result<DispatcherHandle, DispatchError> {
        if self.registry.is_empty() {
            return Err(DispatchError::NoHandlers);
        }

        let mut prepared = Vec::new();
        for queue in self.registry.queues() {
            let Some(handler) = self.registry.get(&queue) else {
                continue;
            };
            let config = self.queue_configs.get(&queue).cloned().unwrap_or_default();
            let policy = RetryPolicy::from_config(&queue, &config.retry)?;
            prepared.push((QueueWorker::new(&queue, handler, policy, self.recoverer.clone()), config));
        }

        let mut consumers: Vec<(QueueWorker, QueueConsumerConfig, String, Box<dyn Consumer>)> = Vec::new();
        for (worker, config) in prepared {
            let tag = consumer_tag(worker.queue());
            match self
                .broker
                .consume(worker.queue(), &tag, config.effective_prefetch())
                .await
            {
                Ok(consumer) => consumers.push((worker, config, tag, consumer)),
                Err(e) => {
                    for (_, _, _, mut opened) in consumers {
                        let _ = opened.close().await;
                    }
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        for (worker, config, tag, consumer) in consumers {
            info!(
                queue = %worker.queue(),
                concurrency = config.effective_concurrency(),
                prefetch = config.effective_prefetch(),
                max_attempts = worker.policy().max_attempts,
                "Starting queue worker"
            );
            let task = WorkerTask {
                broker: self.broker.clone(),
                worker,
                config,
                consumer_tag: tag,
                shutdown_grace: self.shutdown_grace,
            };
            workers.push(tokio::spawn(task.run(consumer, shutdown_rx.clone())));
        }

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            workers,
        })
    }
}

fn consumer_tag(queue: &str) -> String {
    format!("payment-relay.{}.{}", queue, Uuid::new_v4().simple())
}

/// Running dispatcher.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) detaches
/// the workers: they keep consuming until the runtime stops.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<WorkerSummary>>,
}

impl DispatcherHandle {
    /// Stop intake, let in-flight deliveries finish within the grace period,
    /// and close the consumers.
    pub async fn shutdown(self) -> Vec<WorkerSummary> {
        info!("Dispatcher shutting down");
        let _ = self.shutdown.send(true);

        let mut summaries = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.await {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(error = %e, "Queue worker task failed"),
            }
        }
        summaries
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Resolves once shutdown was requested. Never resolves if the handle was
/// dropped instead.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct WorkerTask {
    broker: Arc<dyn Broker>,
    worker: QueueWorker,
    config: QueueConsumerConfig,
    consumer_tag: String,
    shutdown_grace: Duration,
}

impl WorkerTask {
    async fn run(
        self,
        mut consumer: Box<dyn Consumer>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerSummary {
        let queue = self.worker.queue().to_string();
        let mut summary = WorkerSummary::new(&queue);
        let slots = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let mut in_flight: JoinSet<DeliveryOutcome> = JoinSet::new();

        'intake: loop {
            while let Some(joined) = in_flight.try_join_next() {
                summary.record(joined);
            }
            if *shutdown.borrow() {
                break;
            }

            // A free slot first, so a busy worker leaves deliveries with the broker.
            let permit = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                next = consumer.recv() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let worker = self.worker.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process_delivery(delivery).await
                    });
                }
                Some(Err(e)) => {
                    warn!(queue = %queue, error = %e, "Consumer stream failed, reconnecting");
                    drop(permit);
                    match self.reconnect(&mut shutdown).await {
                        Some(fresh) => {
                            let _ = consumer.close().await;
                            consumer = fresh;
                            summary.reconnects += 1;
                        }
                        None => break 'intake,
                    }
                }
                None => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(queue = %queue, "Consumer stream ended, reconnecting");
                    drop(permit);
                    match self.reconnect(&mut shutdown).await {
                        Some(fresh) => {
                            let _ = consumer.close().await;
                            consumer = fresh;
                            summary.reconnects += 1;
                        }
                        None => break 'intake,
                    }
                }
            }
        }

        if let Err(e) = consumer.cancel().await {
            warn!(queue = %queue, error = %e, "Failed to cancel consumer");
        }

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                summary.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = %queue,
                remaining = in_flight.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "Grace period elapsed, aborting in-flight deliveries"
            );
            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                summary.record(joined);
            }
        }

        // Unacked deliveries return to the queue when the channel closes.
        if let Err(e) = consumer.close().await {
            warn!(queue = %queue, error = %e, "Failed to close consumer");
        }

        info!(
            queue = %queue,
            acked = summary.acked,
            dead_lettered = summary.dead_lettered,
            ack_failed = summary.ack_failed,
            aborted = summary.aborted,
            "Queue worker stopped"
        );
        summary
    }

    /// Re-open the consumer with backoff. `None` if shutdown was requested.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Box<dyn Consumer>> {
        let queue = self.worker.queue();
        let prefetch = self.config.effective_prefetch();

        for (attempt, delay) in consumer_reconnect_backoff().build().enumerate() {
            tokio::select! {
                _ = shutdown_requested(shutdown) => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                return None;
            }

            match self.broker.consume(queue, &self.consumer_tag, prefetch).await {
                Ok(consumer) => {
                    info!(queue = %queue, attempt = attempt + 1, "Consumer re-established");
                    return Some(consumer);
                }
                Err(e) => {
                    warn!(
                        queue = %queue,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to re-establish consumer"
                    );
                }
            }
        }

        error!(queue = %queue, "Giving up on consumer reconnection");
        None
    }
}
