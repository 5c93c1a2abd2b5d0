//! # Constants
//!
//! Default values and fixed identifiers used across the operator.

use std::time::Duration;

// Command-line defaults
pub const DEFAULT_METRICS_ADDR: &str = ":8080";
pub const DEFAULT_HEALTH_ADDR: &str = ":8081";
pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Value of `--metrics-addr` that turns the metrics endpoint off
pub const METRICS_DISABLED: &str = "0";

/// Environment toggle for webhook certificate bootstrap and webhook registration.
/// Only the literal value `false` disables webhooks.
pub const ENABLE_WEBHOOKS_ENV: &str = "ENABLE_WEBHOOKS";

/// Port the admission webhook TLS server listens on
pub const WEBHOOK_PORT: u16 = 9443;

/// Lease name used for leader election among operator replicas
pub const LEADER_ELECTION_ID: &str = "f8e4a0d9.secrets.forgerock.io";

/// How long the manager waits for runnables to stop after a termination signal
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// Leader election timings
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// A leader that cannot renew for this long gives up leadership
pub const LEASE_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const LEASE_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Field manager recorded on status patches issued by the operator
pub const FIELD_MANAGER: &str = "secret-agent";

// Operator namespace discovery
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

// Webhook serving material
pub const TLS_CERT_FILE: &str = "tls.crt";
pub const TLS_KEY_FILE: &str = "tls.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const WEBHOOK_SERVICE_NAME_ENV: &str = "WEBHOOK_SERVICE_NAME";
pub const DEFAULT_WEBHOOK_SERVICE_NAME: &str = "secret-agent-webhook-service";
pub const VALIDATING_WEBHOOK_CONFIGURATION: &str = "secret-agent-validating-webhook-configuration";
pub const MUTATING_WEBHOOK_CONFIGURATION: &str = "secret-agent-mutating-webhook-configuration";
/// Secret in the operator namespace sharing the webhook CA and serving pair between replicas
pub const WEBHOOK_CERT_SECRET: &str = "secret-agent-webhook-server-cert";

/// How often the webhook server checks the certificate files for changes
pub const CERT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

// Logger names
pub const SETUP_LOG: &str = "setup";
pub const MANAGER_LOG: &str = "manager";
pub const LEADER_ELECTION_LOG: &str = "leader-election";
pub const WEBHOOK_LOG: &str = "webhook";
pub const CONTROLLER_LOG: &str = "controllers.SecretAgentConfiguration";

/// Name the reconciliation controller is registered under
pub const CONTROLLER_NAME: &str = "SecretAgentConfiguration";

// Reconciliation requeue intervals
pub const DEFAULT_RECONCILE_REQUEUE_SECS: u64 = 300;
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;
