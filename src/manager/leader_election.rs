//! # Leader Election
//!
//! Lease-based leader election over `coordination.k8s.io/v1` Leases.
//!
//! Every write carries the `resourceVersion` read just before it, so two
//! replicas racing for the same lease cannot both win: the loser gets a 409
//! Conflict and retries on the next period.
//!
//! The leader renews every retry period. If it cannot renew for a full renew
//! deadline it gives up leadership, and the manager treats that as fatal.

use crate::constants::{
    LEADER_ELECTION_LOG, LEASE_DURATION, LEASE_RENEW_DEADLINE, LEASE_RETRY_PERIOD,
};
use crate::observability::metrics;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),

    #[error("malformed lease: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lease spec fields that take part in the election
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "micro_time")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "micro_time")]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_transitions: Option<i32>,
}

/// `MicroTime` wire format: RFC 3339 with microsecond precision
mod micro_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option, reason = "Signature required by serde's `with` attribute")]
    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|time| time.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

impl LeaseRecord {
    fn from_lease(lease: &Lease) -> Result<Self, serde_json::Error> {
        match &lease.spec {
            Some(spec) => serde_json::from_value(serde_json::to_value(spec)?),
            None => Ok(Self::default()),
        }
    }

    /// Held by a live candidate at `now`
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        let Some(holder) = self.holder_identity.as_deref() else {
            return false;
        };
        if holder.is_empty() {
            return false;
        }
        match (self.renew_time, self.lease_duration_seconds) {
            (Some(renewed), Some(seconds)) => now <= renewed + chrono::Duration::seconds(i64::from(seconds)),
            _ => false,
        }
    }
}

/// What a candidate should do with the lease it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; extend the renew time
    Renew,
    /// Released or expired; claim it and bump the transition count
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

/// Decide the next step for `identity` given the current lease, if any
pub fn decide(existing: Option<&LeaseRecord>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(record) = existing else {
        return LeaseAction::Create;
    };
    if record.holder_identity.as_deref() == Some(identity) {
        return LeaseAction::Renew;
    }
    if record.is_held(now) {
        LeaseAction::Wait
    } else {
        LeaseAction::TakeOver {
            transitions: record.lease_transitions.unwrap_or(0) + 1,
        }
    }
}

/// How long a lease lasts and how often it is renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimings {
    pub lease_duration: Duration,
    /// A leader that cannot renew for this long gives up leadership
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseTimings {
    /// 15s lease, 10s renew deadline, 2s retry
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: LEASE_RENEW_DEADLINE,
            retry_period: LEASE_RETRY_PERIOD,
        }
    }
}

/// Identity of this candidate: `<hostname>_<uuid>`
pub fn candidate_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

/// Leader elector for one lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    timings: LeaseTimings,
}

impl fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease_name", &self.lease_name)
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str, timings: LeaseTimings) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until leadership is acquired
    ///
    /// Transient API errors are logged and retried; the caller bounds the wait
    /// by dropping the future on shutdown.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            target: LEADER_ELECTION_LOG,
            identity = %self.identity,
            lease = %format!("{}/{}", self.namespace, self.lease_name),
            "attempting to acquire leader lease..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(
                        target: LEADER_ELECTION_LOG,
                        identity = %self.identity,
                        "successfully acquired lease {}/{}",
                        self.namespace,
                        self.lease_name
                    );
                    metrics::set_leader_status(true);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        target: LEADER_ELECTION_LOG,
                        identity = %self.identity,
                        "lease is held by another candidate, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        target: LEADER_ELECTION_LOG,
                        identity = %self.identity,
                        error = %e,
                        "error retrieving or updating lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timings.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = watch::channel(false);
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// One compare-and-swap round against the lease; `Ok(true)` means we hold it
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let now = Utc::now();

        let existing = api.get_opt(&self.lease_name).await?;
        let record = existing.as_ref().map(LeaseRecord::from_lease).transpose()?;

        let (next, resource_version) = match decide(record.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                let record = self.claim(now, now, 0);
                let lease = self.lease_object(&record, None)?;
                return match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(target: LEADER_ELECTION_LOG, identity = %self.identity, "created new lease");
                        Ok(true)
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        debug!(target: LEADER_ELECTION_LOG, "lease creation conflict, will retry");
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                };
            }
            LeaseAction::Renew => {
                let current = record.unwrap_or_default();
                let acquired = current.acquire_time.unwrap_or(now);
                let transitions = current.lease_transitions.unwrap_or(0);
                (self.claim(acquired, now, transitions), existing)
            }
            LeaseAction::TakeOver { transitions } => {
                info!(
                    target: LEADER_ELECTION_LOG,
                    identity = %self.identity,
                    previous = ?record.as_ref().and_then(|r| r.holder_identity.clone()),
                    transitions,
                    "lease expired or released, taking over"
                );
                (self.claim(now, now, transitions), existing)
            }
        };

        let resource_version = resource_version
            .and_then(|lease| lease.metadata.resource_version)
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;
        let lease = self.lease_object(&next, Some(resource_version))?;

        match api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => {
                debug!(target: LEADER_ELECTION_LOG, identity = %self.identity, "lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(target: LEADER_ELECTION_LOG, identity = %self.identity, "lease update conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn claim(&self, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(i32::try_from(self.timings.lease_duration.as_secs()).unwrap_or(i32::MAX)),
            acquire_time: Some(acquired),
            renew_time: Some(renewed),
            lease_transitions: Some(transitions),
        }
    }

    fn lease_object(&self, record: &LeaseRecord, resource_version: Option<String>) -> Result<Lease, serde_json::Error> {
        let mut metadata = json!({
            "name": self.lease_name,
            "namespace": self.namespace,
        });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": record,
        }))
    }

    /// Renew every retry period until the renew deadline is missed
    async fn renewal_loop(&self, lost_tx: watch::Sender<bool>) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.timings.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(target: LEADER_ELECTION_LOG, identity = %self.identity, "lease acquired by another candidate");
                    break;
                }
                Err(e) => {
                    warn!(target: LEADER_ELECTION_LOG, identity = %self.identity, error = %e, "failed to renew lease");
                    if last_renewed.elapsed() >= self.timings.renew_deadline {
                        warn!(
                            target: LEADER_ELECTION_LOG,
                            identity = %self.identity,
                            deadline_secs = self.timings.renew_deadline.as_secs(),
                            "failed to renew lease within the renew deadline"
                        );
                        break;
                    }
                }
            }
        }

        metrics::set_leader_status(false);
        let _ = lost_tx.send(true);
    }

    /// Hand the lease back so another replica can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api = self.api();
        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let record = LeaseRecord::from_lease(&lease)?;
        if record.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(target: LEADER_ELECTION_LOG, identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration_seconds: Some(1),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: record.lease_transitions,
        };
        let lease = self.lease_object(&released, lease.metadata.resource_version)?;
        api.replace(&self.lease_name, &PostParams::default(), &lease).await?;
        info!(
            target: LEADER_ELECTION_LOG,
            identity = %self.identity,
            released_at = %now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "lease released"
        );
        Ok(())
    }
}

/// Held while this replica is the leader
///
/// Dropping the guard stops renewal; the lease then expires on its own.
/// [`LeaderGuard::release`] hands it back immediately.
#[derive(Debug)]
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: watch::Receiver<bool>,
}

impl LeaderGuard {
    /// Resolves once leadership is lost; safe to poll again after being dropped in a `select!`
    pub async fn lost(&mut self) {
        let _ = self.lost_rx.wait_for(|lost| *lost).await;
    }

    pub async fn release(self) {
        self.renewal_task.abort();
        metrics::set_leader_status(false);
        if let Err(e) = self.elector.release_lease().await {
            warn!(target: LEADER_ELECTION_LOG, error = %e, "failed to release lease");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_by(holder: &str, renewed: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(15),
            acquire_time: Some(renewed),
            renew_time: Some(renewed),
            lease_transitions: Some(3),
        }
    }

    #[test]
    fn test_missing_lease_is_created() {
        assert_eq!(decide(None, "me", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let now = Utc::now();
        let record = held_by("me", now - chrono::Duration::seconds(60));
        assert_eq!(decide(Some(&record), "me", now), LeaseAction::Renew);
    }

    #[test]
    fn test_live_foreign_lease_waits() {
        let now = Utc::now();
        let record = held_by("other", now - chrono::Duration::seconds(5));
        assert_eq!(decide(Some(&record), "me", now), LeaseAction::Wait);
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let now = Utc::now();
        let record = held_by("other", now - chrono::Duration::seconds(16));
        assert_eq!(
            decide(Some(&record), "me", now),
            LeaseAction::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn test_released_lease_is_taken_over() {
        let now = Utc::now();
        let mut record = held_by("other", now);
        record.holder_identity = None;
        assert_eq!(
            decide(Some(&record), "me", now),
            LeaseAction::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn test_record_round_trips_through_lease_spec() {
        let now = Utc::now();
        let record = held_by("me", now);
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {"name": "lease", "namespace": "ns", "resourceVersion": "7"},
            "spec": record,
        }))
        .unwrap();
        let back = LeaseRecord::from_lease(&lease).unwrap();

        assert_eq!(back.holder_identity.as_deref(), Some("me"));
        assert_eq!(back.lease_transitions, Some(3));
        // Wire format keeps microseconds only
        let renewed = back.renew_time.unwrap();
        assert_eq!(renewed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_candidate_identity_is_unique() {
        assert_ne!(candidate_identity(), candidate_identity());
    }
}
