//! Payment Relay - reliable delivery of order-payment outcomes
//!
//! Publishes payment outcome events to RabbitMQ with publisher confirms and
//! mandatory returns, consumes them with in-place retry, and dead-letters
//! messages whose handlers keep failing.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod event;
pub mod handlers;
pub mod publisher;
pub mod topology;
pub mod utils;
