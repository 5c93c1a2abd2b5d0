//! # Secret Agent Manager
//!
//! Entry point of the secret-agent operator. Parses the flags, installs logging,
//! builds the manager and runs it until SIGTERM or SIGINT.
//!
//! ## Usage
//!
//! ```sh
//! secret-agent-manager --metrics-addr=:8080 --health-addr=:8081 --enable-leader-election
//! ```
//!
//! Set `ENABLE_WEBHOOKS=false` to run without the admission webhooks, for
//! example when running outside the cluster.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    secret_agent::runtime::run().await
}
