//! # Metrics Module
//!
//! Prometheus metrics served on the manager's metrics endpoint, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup, registration and text encoding
//! - `controller_metrics` - Reconciliation metrics (reconciliations, errors, requeues)
//! - `manager_metrics` - Manager lifecycle metrics (leader status, admission requests, certificates)

pub mod controller_metrics;
pub mod manager_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use manager_metrics::*;
pub use registry::*;
