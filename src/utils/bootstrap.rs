//! Bootstrap utilities for the payment-relay binary.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;

/// Environment variable holding the tracing filter directives.
pub const LOG_ENV_VAR: &str = "PAYMENT_RELAY_LOG";

/// Initialize tracing with the PAYMENT_RELAY_LOG environment variable.
///
/// Defaults to "info" level if PAYMENT_RELAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a service with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "rabbitmq")
/// * `address` - The address to connect to, as logged
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                tracing::info!("Connected to {} at {}", service_name, address);
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}...",
                        service_name, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        "Failed to connect to {} after {} attempts: {}",
                        service_name,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}
