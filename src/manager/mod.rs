//! # Manager
//!
//! Hosts the shared Kubernetes client and scheme, the metrics and health probe
//! listeners, leader election, the webhook server and every registered runnable.
//!
//! ## Lifecycle
//!
//! 1. [`Manager::new`] connects to the API server and binds the listeners.
//! 2. Controllers, webhooks and probe checks are registered.
//! 3. [`Manager::start`] consumes the manager, so nothing can be registered once
//!    it runs. Always-on runnables (metrics, probes) start at once. Leader-gated
//!    runnables (controllers, webhook server) start after the lease is acquired,
//!    or immediately when leader election is disabled.
//! 4. On the shutdown signal every runnable is cancelled and given the grace
//!    period to stop. Leadership loss or a failing runnable ends the manager
//!    with an error.

mod healthz;
mod leader_election;
mod namespace;
mod runnable;
mod server;
mod signals;

pub use healthz::{ping, Checker, HealthProbes, ProbeError, ProbeKind};
pub use leader_election::{
    candidate_identity, decide, LeaderElectionError, LeaderElector, LeaderGuard, LeaseAction,
    LeaseRecord, LeaseTimings,
};
pub use namespace::operator_namespace;
pub use runnable::{Runnable, Runnables};
pub use server::{metrics_router, HttpServer};
pub use signals::SignalHandler;

use crate::config::Configuration;
use crate::constants::{LEADER_ELECTION_LOG, MANAGER_LOG};
use crate::observability::metrics;
use crate::scheme::{Scheme, SchemeError};
use crate::webhook::WebhookServer;
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to create Kubernetes client: {0}")]
    Client(#[source] kube::Error),

    #[error("unable to reach the Kubernetes API server: {0}")]
    ApiServerUnreachable(#[source] kube::Error),

    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register metrics: {0}")]
    Metrics(String),

    #[error(transparent)]
    Scheme(#[from] SchemeError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("a runnable named {0:?} is already registered")]
    DuplicateRunnable(String),

    #[error(transparent)]
    Webhook(#[from] crate::webhook::WebhookError),

    #[error("{name} failed: {source:#}")]
    Runnable {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{name} task panicked or was cancelled: {reason}")]
    Join { name: String, reason: String },
}

/// Settings the manager is built with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// `None` disables the metrics listener
    pub metrics_addr: Option<SocketAddr>,
    pub health_probe_addr: SocketAddr,
    pub leader_election: bool,
    pub leader_election_id: String,
    pub webhook_port: u16,
    pub cert_dir: PathBuf,
    pub graceful_shutdown_timeout: Duration,
    pub lease_timings: LeaseTimings,
}

impl From<&Configuration> for ManagerOptions {
    fn from(config: &Configuration) -> Self {
        Self {
            metrics_addr: config.metrics_addr.socket_addr(),
            health_probe_addr: config.health_addr,
            leader_election: config.enable_leader_election,
            leader_election_id: config.leader_election_id.clone(),
            webhook_port: config.webhook_port,
            cert_dir: config.cert_dir.clone(),
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
            lease_timings: LeaseTimings::default(),
        }
    }
}

/// The operator's manager
pub struct Manager {
    client: Client,
    scheme: Arc<Scheme>,
    options: ManagerOptions,
    operator_namespace: String,
    metrics_listener: Option<TcpListener>,
    health_listener: TcpListener,
    probes: HealthProbes,
    runnables: Runnables,
    webhook_server: WebhookServer,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("options", &self.options)
            .field("operator_namespace", &self.operator_namespace)
            .field("probes", &self.probes)
            .field("runnables", &self.runnables)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Build a manager from the in-cluster or kubeconfig client configuration
    pub async fn new(options: ManagerOptions, scheme: Scheme) -> Result<Self, ManagerError> {
        let client = Client::try_default().await.map_err(ManagerError::Client)?;
        Self::with_client(client, options, scheme).await
    }

    /// Build a manager around an existing client
    pub async fn with_client(client: Client, options: ManagerOptions, scheme: Scheme) -> Result<Self, ManagerError> {
        let version = client
            .apiserver_version()
            .await
            .map_err(ManagerError::ApiServerUnreachable)?;
        info!(
            target: MANAGER_LOG,
            version = %version.git_version,
            platform = %version.platform,
            "Connected to Kubernetes API server"
        );

        if options.leader_election {
            scheme.ensure_registered::<Lease>()?;
        }
        metrics::register_metrics().map_err(|e| ManagerError::Metrics(e.to_string()))?;

        let metrics_listener = match options.metrics_addr {
            Some(addr) => Some(bind_listener("metrics", addr).await?),
            None => {
                info!(target: MANAGER_LOG, "Metrics endpoint disabled");
                None
            }
        };
        let health_listener = bind_listener("health probe", options.health_probe_addr).await?;

        let operator_namespace = operator_namespace(client.default_namespace());
        let scheme = Arc::new(scheme);
        let webhook_server = WebhookServer::new(options.webhook_port, options.cert_dir.clone(), Arc::clone(&scheme));

        Ok(Self {
            client,
            scheme,
            options,
            operator_namespace,
            metrics_listener,
            health_listener,
            probes: HealthProbes::default(),
            runnables: Runnables::default(),
            webhook_server,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Namespace the operator runs in; also where the leader lease lives
    pub fn operator_namespace(&self) -> &str {
        &self.operator_namespace
    }

    /// Register a runnable; names must be unique
    pub fn add(&mut self, runnable: Box<dyn Runnable>) -> Result<(), ManagerError> {
        let name = runnable.name().to_string();
        self.runnables.add(runnable).map_err(ManagerError::DuplicateRunnable)?;
        debug!(target: MANAGER_LOG, runnable = %name, "Runnable registered");
        Ok(())
    }

    pub fn add_healthz_check(&mut self, name: &str, check: Checker) -> Result<(), ManagerError> {
        self.probes.add_healthz_check(name, check)?;
        Ok(())
    }

    pub fn add_readyz_check(&mut self, name: &str, check: Checker) -> Result<(), ManagerError> {
        self.probes.add_readyz_check(name, check)?;
        Ok(())
    }

    /// Webhook server started with the manager once it has at least one handler
    pub fn webhook_server_mut(&mut self) -> &mut WebhookServer {
        &mut self.webhook_server
    }

    /// Run until `shutdown` resolves or a runnable fails
    ///
    /// Returns `Ok(())` after a graceful shutdown, even when some runnables had
    /// to be aborted at the end of the grace period.
    pub async fn start<F>(self, shutdown: F) -> Result<(), ManagerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            client,
            options,
            operator_namespace,
            metrics_listener,
            health_listener,
            probes,
            mut runnables,
            webhook_server,
            ..
        } = self;

        if let Some(listener) = metrics_listener {
            runnables
                .add(Box::new(HttpServer::from_listener("metrics", listener, metrics_router())))
                .map_err(ManagerError::DuplicateRunnable)?;
        }
        runnables
            .add(Box::new(HttpServer::from_listener("health probe", health_listener, probes.router())))
            .map_err(ManagerError::DuplicateRunnable)?;
        if webhook_server.has_handlers() {
            runnables
                .add(Box::new(webhook_server))
                .map_err(ManagerError::DuplicateRunnable)?;
        }

        let (leader_runnables, always_on) = runnables.partition();
        let token = CancellationToken::new();
        let mut tasks: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();

        for runnable in always_on {
            spawn_runnable(&mut tasks, runnable, token.child_token());
        }

        if options.leader_election {
            let identity = candidate_identity();
            let elector = Arc::new(LeaderElector::new(
                client,
                &options.leader_election_id,
                &operator_namespace,
                &identity,
                options.lease_timings,
            ));
            let leader_token = token.child_token();
            tasks.spawn(async move {
                let result = run_as_leader(elector, leader_runnables, leader_token).await;
                ("leader election".to_string(), result)
            });
        } else {
            for runnable in leader_runnables {
                spawn_runnable(&mut tasks, runnable, token.child_token());
            }
        }

        info!(target: MANAGER_LOG, "Manager started");

        let mut shutdown = std::pin::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(target: MANAGER_LOG, "Stopping and waiting for runnables");
                    break Ok(());
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => {
                        if let Err(e) = finished(joined) {
                            error!(target: MANAGER_LOG, error = %e, "Runnable failed, stopping manager");
                            break Err(e);
                        }
                    }
                    None => {
                        // Nothing left to supervise; wait for the signal
                        (&mut shutdown).await;
                        break Ok(());
                    }
                }
            }
        };

        token.cancel();
        let drained = tokio::time::timeout(options.graceful_shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = finished(joined) {
                    warn!(target: MANAGER_LOG, error = %e, "Runnable returned an error while stopping");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                target: MANAGER_LOG,
                timeout_secs = options.graceful_shutdown_timeout.as_secs(),
                remaining = tasks.len(),
                "Graceful shutdown timed out, aborting remaining runnables"
            );
            tasks.abort_all();
        }

        info!(target: MANAGER_LOG, "All runnables stopped");
        outcome
    }
}

async fn bind_listener(listener: &'static str, addr: SocketAddr) -> Result<TcpListener, ManagerError> {
    let bound = TcpListener::bind(addr)
        .await
        .map_err(|source| ManagerError::Bind { listener, addr, source })?;
    info!(target: MANAGER_LOG, listener, %addr, "Listener bound");
    Ok(bound)
}

fn spawn_runnable(
    tasks: &mut JoinSet<(String, anyhow::Result<()>)>,
    runnable: Box<dyn Runnable>,
    token: CancellationToken,
) {
    let name = runnable.name().to_string();
    debug!(target: MANAGER_LOG, runnable = %name, "Starting runnable");
    tasks.spawn(async move {
        let result = runnable.start(token).await;
        (name, result)
    });
}

fn finished(joined: Result<(String, anyhow::Result<()>), tokio::task::JoinError>) -> Result<(), ManagerError> {
    match joined {
        Ok((name, Ok(()))) => {
            debug!(target: MANAGER_LOG, runnable = %name, "Runnable finished");
            Ok(())
        }
        Ok((name, Err(source))) => Err(ManagerError::Runnable { name, source }),
        Err(e) => Err(ManagerError::Join {
            name: "runnable".to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Wait for the lease, run the leader-gated runnables, and give the lease back on shutdown
async fn run_as_leader(
    elector: Arc<LeaderElector>,
    runnables: Vec<Box<dyn Runnable>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut guard = tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        guard = Arc::clone(&elector).acquire() => guard,
    };

    let leader_token = shutdown.child_token();
    let mut tasks: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();
    for runnable in runnables {
        spawn_runnable(&mut tasks, runnable, leader_token.clone());
    }

    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            () = guard.lost() => {
                error!(target: LEADER_ELECTION_LOG, identity = %elector.identity(), "leader election lost");
                break Err(anyhow::anyhow!("leader election lost"));
            }
            joined = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(joined) = joined {
                    if let Err(e) = finished(joined) {
                        break Err(e.into());
                    }
                }
            }
        }
    };

    leader_token.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = finished(joined) {
            warn!(target: MANAGER_LOG, error = %e, "Runnable returned an error while stopping");
        }
    }

    if result.is_ok() {
        guard.release().await;
    }
    result
}
