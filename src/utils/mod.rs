//! Startup and backoff helpers shared by the binary and the workers.

pub mod bootstrap;
pub mod retry;
