//! Broker topology: the durable routing graph for payment outcomes.
//!
//! ```text
//!                      order.payment.success      ┌──────────────────────────────┐
//!                   ┌────────────────────────────>│ order.payment.success.queue  │──┐
//! ┌────────────────┐│                             └──────────────────────────────┘  │ reject
//! │ order.payment  ││   order.payment.failed      ┌──────────────────────────────┐  │ (no requeue)
//! │ .exchange      │┴────────────────────────────>│ order.payment.failed.queue   │──┤
//! │ (topic)        │                              └──────────────────────────────┘  │
//! └────────────────┘                                                                 v
//!                  ┌───────────────────────────┐  order.payment.*.dlq  ┌──────────────────────┐
//!                  │ order.payment.success.dlq │<──────────────────────│ order.payment.dlx    │
//!                  │ order.payment.failed.dlq  │                       │ .exchange (direct)   │
//!                  └───────────────────────────┘                       └──────────────────────┘
//! ```
//!
//! The graph is declared once at startup by [`declare`] and never mutated
//! afterwards. Declaration is idempotent; conflicting redeclaration fails.

use serde::Deserialize;
use tracing::info;

use crate::bus::{Broker, BusError, Result};
use crate::event::PaymentStatus;

/// Queue argument naming the dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Topic,
    Direct,
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeType::Topic => f.write_str("topic"),
            ExchangeType::Direct => f.write_str("direct"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
}

/// Where a queue forwards messages it rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Static description of exchanges, queues and bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerTopology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

/// Names for every entity of the payment topology.
///
/// Defaults match the names other services bind against; override only when
/// the whole deployment moves together.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchange: String,
    pub success_queue: String,
    pub success_routing_key: String,
    pub failed_queue: String,
    pub failed_routing_key: String,
    pub dlx_exchange: String,
    pub success_dlq: String,
    pub success_dlq_routing_key: String,
    pub failed_dlq: String,
    pub failed_dlq_routing_key: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: "order.payment.exchange".to_string(),
            success_queue: "order.payment.success.queue".to_string(),
            success_routing_key: "order.payment.success".to_string(),
            failed_queue: "order.payment.failed.queue".to_string(),
            failed_routing_key: "order.payment.failed".to_string(),
            dlx_exchange: "order.payment.dlx.exchange".to_string(),
            success_dlq: "order.payment.success.dlq".to_string(),
            success_dlq_routing_key: "order.payment.success.dlq".to_string(),
            failed_dlq: "order.payment.failed.dlq".to_string(),
            failed_dlq_routing_key: "order.payment.failed.dlq".to_string(),
        }
    }
}

impl TopologyConfig {
    /// Route for successful payments.
    pub fn success_target(&self) -> RoutingTarget {
        RoutingTarget::new(&self.exchange, &self.success_routing_key)
    }

    /// Route for failed payments and failure notices.
    pub fn failed_target(&self) -> RoutingTarget {
        RoutingTarget::new(&self.exchange, &self.failed_routing_key)
    }

    pub fn routes(&self) -> OutcomeRoutes {
        OutcomeRoutes {
            success: self.success_target(),
            failed: self.failed_target(),
        }
    }
}

impl BrokerTopology {
    /// Build the payment outcome graph: topic exchange, two work queues with
    /// dead-letter arguments, a direct DLX and two dead-letter queues.
    pub fn order_payment(names: &TopologyConfig) -> Self {
        let work_queue = |queue: &str, dlq_key: &str| QueueSpec {
            name: queue.to_string(),
            durable: true,
            dead_letter: Some(DeadLetterSpec {
                exchange: names.dlx_exchange.clone(),
                routing_key: dlq_key.to_string(),
            }),
        };
        let dead_letter_queue = |queue: &str| QueueSpec {
            name: queue.to_string(),
            durable: true,
            dead_letter: None,
        };
        let bind = |queue: &str, exchange: &str, key: &str| BindingSpec {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: key.to_string(),
        };

        Self {
            exchanges: vec![
                ExchangeSpec {
                    name: names.exchange.clone(),
                    kind: ExchangeType::Topic,
                    durable: true,
                },
                ExchangeSpec {
                    name: names.dlx_exchange.clone(),
                    kind: ExchangeType::Direct,
                    durable: true,
                },
            ],
            queues: vec![
                work_queue(&names.success_queue, &names.success_dlq_routing_key),
                work_queue(&names.failed_queue, &names.failed_dlq_routing_key),
                dead_letter_queue(&names.success_dlq),
                dead_letter_queue(&names.failed_dlq),
            ],
            bindings: vec![
                bind(
                    &names.success_queue,
                    &names.exchange,
                    &names.success_routing_key,
                ),
                bind(
                    &names.failed_queue,
                    &names.exchange,
                    &names.failed_routing_key,
                ),
                bind(
                    &names.success_dlq,
                    &names.dlx_exchange,
                    &names.success_dlq_routing_key,
                ),
                bind(
                    &names.failed_dlq,
                    &names.dlx_exchange,
                    &names.failed_dlq_routing_key,
                ),
            ],
        }
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Check that every binding and dead-letter argument references an
    /// entity declared in this topology, and that no name is declared twice.
    pub fn validate(&self) -> Result<()> {
        for (i, exchange) in self.exchanges.iter().enumerate() {
            if exchange.name.is_empty() {
                return Err(BusError::Topology("Exchange name must not be empty".into()));
            }
            if self.exchanges[..i].iter().any(|e| e.name == exchange.name) {
                return Err(BusError::Topology(format!(
                    "Exchange '{}' declared twice",
                    exchange.name
                )));
            }
        }
        for (i, queue) in self.queues.iter().enumerate() {
            if queue.name.is_empty() {
                return Err(BusError::Topology("Queue name must not be empty".into()));
            }
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(BusError::Topology(format!(
                    "Queue '{}' declared twice",
                    queue.name
                )));
            }
            if let Some(dl) = &queue.dead_letter {
                if self.exchange(&dl.exchange).is_none() {
                    return Err(BusError::Topology(format!(
                        "Queue '{}' dead-letters to undeclared exchange '{}'",
                        queue.name, dl.exchange
                    )));
                }
            }
        }
        for binding in &self.bindings {
            if self.exchange(&binding.exchange).is_none() {
                return Err(BusError::Topology(format!(
                    "Binding for queue '{}' references undeclared exchange '{}'",
                    binding.queue, binding.exchange
                )));
            }
            if self.queue(&binding.queue).is_none() {
                return Err(BusError::Topology(format!(
                    "Binding references undeclared queue '{}'",
                    binding.queue
                )));
            }
        }
        Ok(())
    }
}

/// Declare the topology on the broker: exchanges, then queues, then bindings.
///
/// Must complete before publishing or consuming starts. Any error here is
/// fatal; there is no valid delivery path without the graph.
pub async fn declare(broker: &dyn Broker, topology: &BrokerTopology) -> Result<()> {
    topology.validate()?;

    for exchange in &topology.exchanges {
        broker.declare_exchange(exchange).await?;
        info!(
            exchange = %exchange.name,
            kind = %exchange.kind,
            durable = exchange.durable,
            "Declared exchange"
        );
    }

    for queue in &topology.queues {
        broker.declare_queue(queue).await?;
        info!(
            queue = %queue.name,
            durable = queue.durable,
            dead_letter_exchange = queue.dead_letter.as_ref().map(|d| d.exchange.as_str()),
            dead_letter_routing_key = queue.dead_letter.as_ref().map(|d| d.routing_key.as_str()),
            "Declared queue"
        );
    }

    for binding in &topology.bindings {
        broker.bind_queue(binding).await?;
        info!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Bound queue to exchange"
        );
    }

    Ok(())
}

/// Exchange + routing key selecting the success or failed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingTarget {
    pub exchange: String,
    pub routing_key: String,
}

impl RoutingTarget {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl std::fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// The two configured routes. Selection looks at the payment status only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRoutes {
    pub success: RoutingTarget,
    pub failed: RoutingTarget,
}

impl OutcomeRoutes {
    pub fn target_for(&self, status: PaymentStatus) -> &RoutingTarget {
        match status {
            PaymentStatus::Success => &self.success,
            PaymentStatus::Failed => &self.failed,
        }
    }
}

impl Default for OutcomeRoutes {
    fn default() -> Self {
        TopologyConfig::default().routes()
    }
}

/// Match a routing key against a topic binding pattern.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    topic_words_match(&pattern, &key)
}

fn topic_words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| topic_words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => topic_words_match(rest, key_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names_match_wire_contract() {
        let topology = BrokerTopology::order_payment(&TopologyConfig::default());

        let outcome = topology.exchange("order.payment.exchange").unwrap();
        assert_eq!(outcome.kind, ExchangeType::Topic);
        assert!(outcome.durable);

        let dlx = topology.exchange("order.payment.dlx.exchange").unwrap();
        assert_eq!(dlx.kind, ExchangeType::Direct);

        let success = topology.queue("order.payment.success.queue").unwrap();
        assert_eq!(
            success.dead_letter,
            Some(DeadLetterSpec {
                exchange: "order.payment.dlx.exchange".to_string(),
                routing_key: "order.payment.success.dlq".to_string(),
            })
        );
        let failed = topology.queue("order.payment.failed.queue").unwrap();
        assert_eq!(
            failed.dead_letter.as_ref().unwrap().routing_key,
            "order.payment.failed.dlq"
        );

        assert!(topology.queue("order.payment.success.dlq").unwrap().durable);
        assert!(topology
            .queue("order.payment.failed.dlq")
            .unwrap()
            .dead_letter
            .is_none());
        assert_eq!(topology.bindings.len(), 4);
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling_binding() {
        let mut topology = BrokerTopology::order_payment(&TopologyConfig::default());
        topology.bindings.push(BindingSpec {
            queue: "missing.queue".to_string(),
            exchange: "order.payment.exchange".to_string(),
            routing_key: "x".to_string(),
        });
        assert!(matches!(topology.validate(), Err(BusError::Topology(_))));
    }

    #[test]
    fn test_validate_rejects_undeclared_dlx() {
        let mut topology = BrokerTopology::order_payment(&TopologyConfig::default());
        topology.exchanges.retain(|e| e.kind != ExchangeType::Direct);
        topology.bindings.retain(|b| b.exchange != "order.payment.dlx.exchange");
        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("dead-letters to undeclared exchange"));
    }

    #[test]
    fn test_routes_follow_status() {
        let routes = OutcomeRoutes::default();
        assert_eq!(
            routes.target_for(PaymentStatus::Success).routing_key,
            "order.payment.success"
        );
        assert_eq!(
            routes.target_for(PaymentStatus::Failed).routing_key,
            "order.payment.failed"
        );
        assert_eq!(
            routes.success.to_string(),
            "order.payment.exchange/order.payment.success"
        );
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("order.payment.success", "order.payment.success"));
        assert!(!topic_matches("order.payment.success", "order.payment.failed"));
        assert!(topic_matches("order.*.success", "order.payment.success"));
        assert!(!topic_matches("order.*", "order.payment.success"));
        assert!(topic_matches("order.#", "order.payment.success"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("order.payment", "order.payment.success"));
    }
}
