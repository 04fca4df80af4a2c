pub mod config;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod types;
pub mod validation;

// Application use cases and the ports they depend on
pub mod app;
// Adapters implementing the ports
pub mod infra;
