//! # Operator Configuration
//!
//! Startup parameters parsed from the command line, plus the `ENABLE_WEBHOOKS`
//! toggle resolved once from the environment.
//!
//! The resulting [`Configuration`] is immutable and shared read-only by every
//! component after startup.

mod address;

pub use address::{parse_bind_address, MetricsAddress};

use crate::constants::{
    DEFAULT_CERT_DIR, DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT, DEFAULT_HEALTH_ADDR,
    DEFAULT_METRICS_ADDR, ENABLE_WEBHOOKS_ENV, LEADER_ELECTION_ID, WEBHOOK_PORT,
};
use clap::{ArgAction, CommandFactory, Parser};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors, detected before any other component is constructed
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error(transparent)]
    Args(#[from] clap::Error),
}

/// Command-line flags of the operator manager
#[derive(Parser, Debug, Clone)]
#[command(name = "secret-agent-manager")]
#[command(about = "Manages the lifecycle of SecretAgentConfiguration resources", long_about = None)]
#[command(version)]
pub struct Cli {
    /// The address the metric endpoint binds to. Set to 0 to disable metrics
    #[arg(long, default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_addr: MetricsAddress,

    /// The address the healthz/readyz endpoint binds to.
    #[arg(long, default_value = DEFAULT_HEALTH_ADDR, value_parser = parse_bind_address)]
    pub health_addr: SocketAddr,

    /// Enable leader election for controller manager. Enabling this will ensure
    /// there is only one active controller manager.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = parse_bool_flag
    )]
    pub enable_leader_election: bool,

    /// Directory where to store/read the webhook certs.
    #[arg(long, default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// Set to true to enable debug
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = parse_bool_flag
    )]
    pub debug: bool,

    /// Namespace where the cloud credentials secrets are located. Defaults to the operator namespace
    #[arg(long, default_value = "")]
    pub cloud_secrets_namespace: String,
}

/// Immutable snapshot of the startup parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub metrics_addr: MetricsAddress,
    pub health_addr: SocketAddr,
    pub enable_leader_election: bool,
    pub cert_dir: PathBuf,
    pub debug: bool,
    /// `None` when the flag was empty: the operator's own namespace applies
    pub cloud_secrets_namespace: Option<String>,
    /// Resolved from `ENABLE_WEBHOOKS`
    pub webhooks_enabled: bool,
    pub webhook_port: u16,
    pub leader_election_id: String,
    pub graceful_shutdown_timeout: Duration,
}

impl Configuration {
    /// Load from the process arguments and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(
            std::env::args_os(),
            std::env::var(ENABLE_WEBHOOKS_ENV).ok().as_deref(),
        )
    }

    /// Load from explicit arguments (first item is the program name) and the
    /// raw value of `ENABLE_WEBHOOKS`
    pub fn load_from<I, T>(args: I, enable_webhooks: Option<&str>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(single_dash_to_long(args))?;
        Ok(Self::from_cli(cli, enable_webhooks))
    }

    pub fn from_cli(cli: Cli, enable_webhooks: Option<&str>) -> Self {
        let cloud_secrets_namespace = Some(cli.cloud_secrets_namespace.trim().to_string())
            .filter(|namespace| !namespace.is_empty());

        Self {
            metrics_addr: cli.metrics_addr,
            health_addr: cli.health_addr,
            enable_leader_election: cli.enable_leader_election,
            cert_dir: cli.cert_dir,
            debug: cli.debug,
            cloud_secrets_namespace,
            webhooks_enabled: webhooks_enabled(enable_webhooks),
            webhook_port: WEBHOOK_PORT,
            leader_election_id: LEADER_ELECTION_ID.to_string(),
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Boolean flag values, spelled the way Go's `strconv.ParseBool` accepts them
pub fn parse_bool_flag(value: &str) -> Result<bool, String> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => Err(format!("invalid boolean value {other:?}")),
    }
}

/// Rewrite `-name[=value]` to `--name[=value]` for every long flag, so both
/// spellings Go's `flag` package accepts are understood. Arguments after a
/// bare `--` are left alone.
fn single_dash_to_long<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let command = Cli::command();
    let long_names: Vec<&str> = command
        .get_arguments()
        .filter_map(|arg| arg.get_long())
        .chain(["help", "version"])
        .collect();

    let mut terminated = false;
    args.into_iter()
        .map(Into::into)
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 || terminated {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                terminated = true;
                return arg;
            }
            match text.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') => {
                    let name = rest.split_once('=').map_or(rest, |(name, _)| name);
                    if name.len() > 1 && long_names.contains(&name) {
                        OsString::from(format!("-{text}"))
                    } else {
                        arg
                    }
                }
                _ => arg,
            }
        })
        .collect()
}

/// Webhooks stay on unless the toggle is exactly `false`
pub fn webhooks_enabled(value: Option<&str>) -> bool {
    value != Some("false")
}
