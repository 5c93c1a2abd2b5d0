//! # Manager Metrics
//!
//! Leader status, admission traffic and webhook certificate metrics.

use super::registry::register_collector;
use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

static LEADER_STATUS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "secret_agent_leader_election_master_status",
        "1 while this replica holds the leader election lease, 0 otherwise",
    )
    .expect("Failed to create LEADER_STATUS metric - this should never happen")
});

static ADMISSION_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_agent_webhook_requests_total",
            "Total number of admission requests by webhook path and outcome",
        ),
        &["webhook", "allowed"],
    )
    .expect("Failed to create ADMISSION_REQUESTS_TOTAL metric - this should never happen")
});

static CERTIFICATES_ISSUED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secret_agent_webhook_certificates_issued_total",
        "Total number of webhook serving certificates generated",
    )
    .expect("Failed to create CERTIFICATES_ISSUED_TOTAL metric - this should never happen")
});

pub(crate) fn register_manager_metrics() -> Result<()> {
    register_collector(Box::new(LEADER_STATUS.clone()))?;
    register_collector(Box::new(ADMISSION_REQUESTS_TOTAL.clone()))?;
    register_collector(Box::new(CERTIFICATES_ISSUED_TOTAL.clone()))?;
    Ok(())
}

pub fn set_leader_status(is_leader: bool) {
    LEADER_STATUS.set(i64::from(is_leader));
}

pub fn increment_admission_requests(webhook: &str, allowed: bool) {
    ADMISSION_REQUESTS_TOTAL
        .with_label_values(&[webhook, if allowed { "true" } else { "false" }])
        .inc();
}

pub fn increment_certificates_issued() {
    CERTIFICATES_ISSUED_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_status_gauge() {
        set_leader_status(true);
        assert_eq!(LEADER_STATUS.get(), 1);
        set_leader_status(false);
        assert_eq!(LEADER_STATUS.get(), 0);
    }
}
