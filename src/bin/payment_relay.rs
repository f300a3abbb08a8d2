//! payment-relay: order-payment outcome delivery
//!
//! Declares the broker topology, then either consumes both outcome queues
//! until Ctrl+C or publishes a single outcome event.
//!
//! ## Architecture
//! ```text
//! [publish <file>] --(confirm + mandatory)--> order.payment.exchange
//!                                                  |
//!                        +-------------------------+------------------------+
//!                        v                                                  v
//!          order.payment.success.queue                        order.payment.failed.queue
//!                        |                                                  |
//!                   [consume] --(3 attempts, then reject)--> order.payment.dlx.exchange
//! ```
//!
//! ## Usage
//! ```text
//! payment-relay [--config <path>] [--simulate-failure] [consume]
//! payment-relay [--config <path>] publish <event.json>
//! ```
//!
//! ## Configuration
//! - PAYMENT_RELAY_CONFIG: Path to a YAML config file
//! - PAYMENT_RELAY__SECTION__KEY: Override any config value
//! - PAYMENT_RELAY_LOG: tracing filter (default: info)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use payment_relay::bus::{init_broker, redact_url, BrokerHandles};
use payment_relay::config::Config;
use payment_relay::dispatch::ConsumerDispatcher;
use payment_relay::dlq::LoggingRejectRecoverer;
use payment_relay::event::OutcomeEvent;
use payment_relay::handlers::default_registry;
use payment_relay::publisher::Publisher;
use payment_relay::topology::{declare, BrokerTopology};
use payment_relay::utils::bootstrap::{connect_with_retry, init_tracing};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Consume { simulate_failure: bool },
    Publish { file: PathBuf },
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli, String> {
    let mut config_path = None;
    let mut simulate_failure = false;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(args.next().ok_or("--config requires a path")?);
            }
            "--simulate-failure" => simulate_failure = true,
            flag if flag.starts_with('-') => return Err(format!("Unknown option '{}'", flag)),
            _ => positional.push(arg),
        }
    }

    let command = match positional.as_slice() {
        [] => Command::Consume { simulate_failure },
        [cmd] if cmd == "consume" => Command::Consume { simulate_failure },
        [cmd, file] if cmd == "publish" => Command::Publish {
            file: PathBuf::from(file),
        },
        [cmd] if cmd == "publish" => return Err("publish requires an event file".to_string()),
        other => return Err(format!("Unexpected arguments: {}", other.join(" "))),
    };

    Ok(Cli {
        config_path,
        command,
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let cli = parse_args(std::env::args().skip(1)).map_err(|e| {
        error!("{}", e);
        e
    })?;

    let config = Config::load(cli.config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;

    let address = redact_url(&config.messaging.amqp.url);
    let handles = connect_with_retry("broker", &address, || {
        init_broker(&config.messaging)
    })
    .await?;

    // No valid delivery path without the topology.
    declare(
        handles.broker.as_ref(),
        &BrokerTopology::order_payment(&config.topology),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Topology declaration failed");
        e
    })?;

    let result = match cli.command {
        Command::Consume { simulate_failure } => consume(&config, &handles, simulate_failure).await,
        Command::Publish { file } => publish(&config, &handles, &file).await,
    };

    if let Err(e) = handles.broker.close().await {
        error!(error = %e, "Failed to close broker connection");
    }
    result
}

async fn consume(
    config: &Config,
    handles: &BrokerHandles,
    simulate_failure: bool,
) -> Result<(), BoxError> {
    let registry = default_registry(&config.topology, simulate_failure)?;
    let dispatcher = ConsumerDispatcher::from_config(
        handles.broker.clone(),
        registry,
        Arc::new(LoggingRejectRecoverer::new()),
        &config.topology,
        &config.consumers,
    );
    let handle = dispatcher.start().await?;

    info!(workers = handle.worker_count(), "payment-relay consuming");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for summary in handle.shutdown().await {
        info!(
            queue = %summary.queue,
            acked = summary.acked,
            dead_lettered = summary.dead_lettered,
            aborted = summary.aborted,
            "Queue summary"
        );
    }
    Ok(())
}

async fn publish(
    config: &Config,
    handles: &BrokerHandles,
    file: &Path,
) -> Result<(), BoxError> {
    let raw = tokio::fs::read(file).await?;
    let event: OutcomeEvent = serde_json::from_slice(&raw)?;
    event.validate()?;

    let (publisher, signals) = Publisher::new(handles.transport.clone(), config.publisher.clone());
    let monitor = signals.spawn_monitor();

    let result = publisher
        .publish_outcome(&config.topology.routes(), &event)
        .await;

    // The monitor ends once the confirm for this publish has been reported.
    drop(publisher);
    let summary = monitor.await?;

    let receipt = result.map_err(|e| {
        error!(order_id = %event.order_id, error = %e, "Outcome not delivered; persist for manual replay");
        e
    })?;
    info!(
        message_id = %receipt.message_id,
        target = %receipt.target,
        attempts = receipt.attempts,
        acked = summary.acked,
        returned = summary.returned,
        "Outcome published"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_command_is_consume() {
        assert_eq!(
            parse_args(args(&[])).unwrap().command,
            Command::Consume {
                simulate_failure: false
            }
        );
    }

    #[test]
    fn test_publish_with_config() {
        let cli = parse_args(args(&["--config", "relay.yaml", "publish", "event.json"])).unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("relay.yaml"));
        assert_eq!(
            cli.command,
            Command::Publish {
                file: PathBuf::from("event.json")
            }
        );
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse_args(args(&["publish"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["consume", "extra"])).is_err());
    }
}
