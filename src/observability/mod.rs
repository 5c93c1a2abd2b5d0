//! # Observability
//!
//! Structured logging and Prometheus metrics for the operator.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogLevel};
