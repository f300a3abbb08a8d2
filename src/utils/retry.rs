//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Message-level retry
//! delays are configured per queue (see `dispatch::RetryPolicy`); these cover
//! reconnecting to the broker.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for the initial broker connection at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for re-establishing a consumer after its stream failed.
///
/// - Min delay: 500ms
/// - Max delay: 30s
/// - Max attempts: effectively unbounded (shutdown stops it)
/// - Jitter enabled
pub fn consumer_reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
        .with_jitter()
}
