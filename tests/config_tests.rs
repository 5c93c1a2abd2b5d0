//! # Configuration Tests
//!
//! Flag parsing from the command line into a [`Configuration`].
//!
//! These tests verify:
//! - Defaults when no flag is given
//! - Every flag lands in its field
//! - Boolean flags take every spelling Go's flag package accepts
//! - Single-dash long flags are understood
//! - Malformed values are rejected
//! - `ENABLE_WEBHOOKS` handling

use secret_agent::config::{Configuration, MetricsAddress};
use secret_agent::constants::{LEADER_ELECTION_ID, WEBHOOK_PORT};
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_defaults() {
    let config = Configuration::load_from(["secret-agent-manager"], None).unwrap();

    assert_eq!(
        config.metrics_addr,
        MetricsAddress::Bind("0.0.0.0:8080".parse().unwrap())
    );
    assert_eq!(config.health_addr, "0.0.0.0:8081".parse().unwrap());
    assert!(!config.enable_leader_election);
    assert_eq!(
        config.cert_dir,
        PathBuf::from("/tmp/k8s-webhook-server/serving-certs")
    );
    assert!(!config.debug);
    assert_eq!(config.cloud_secrets_namespace, None);
    assert!(config.webhooks_enabled);
    assert_eq!(config.webhook_port, WEBHOOK_PORT);
    assert_eq!(config.leader_election_id, LEADER_ELECTION_ID);
    assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(30));
}

#[test]
fn test_all_flags() {
    let config = Configuration::load_from(
        [
            "secret-agent-manager",
            "--metrics-addr=127.0.0.1:9090",
            "--health-addr",
            "[::1]:9091",
            "--enable-leader-election",
            "--cert-dir=/var/run/certs",
            "--debug=true",
            "--cloud-secrets-namespace",
            "cloud-credentials",
        ],
        Some("true"),
    )
    .unwrap();

    assert_eq!(
        config.metrics_addr,
        MetricsAddress::Bind("127.0.0.1:9090".parse().unwrap())
    );
    assert_eq!(config.health_addr, "[::1]:9091".parse().unwrap());
    assert!(config.enable_leader_election);
    assert_eq!(config.cert_dir, PathBuf::from("/var/run/certs"));
    assert!(config.debug);
    assert_eq!(
        config.cloud_secrets_namespace.as_deref(),
        Some("cloud-credentials")
    );
    assert!(config.webhooks_enabled);
}

#[test]
fn test_explicit_false_bool_flags() {
    let config = Configuration::load_from(
        [
            "secret-agent-manager",
            "--enable-leader-election=false",
            "--debug=false",
        ],
        None,
    )
    .unwrap();
    assert!(!config.enable_leader_election);
    assert!(!config.debug);
}

#[test]
fn test_bool_flags_accept_go_spellings() {
    let load = |flag: &str, value: &str| {
        Configuration::load_from(["secret-agent-manager", format!("--{flag}={value}").as_str()], None)
            .unwrap_or_else(|e| panic!("--{flag}={value}: {e}"))
    };
    for value in ["1", "t", "T", "TRUE", "true", "True"] {
        assert!(load("debug", value).debug, "{value}");
        assert!(load("enable-leader-election", value).enable_leader_election, "{value}");
    }
    for value in ["0", "f", "F", "FALSE", "false", "False"] {
        assert!(!load("debug", value).debug, "{value}");
        assert!(!load("enable-leader-election", value).enable_leader_election, "{value}");
    }
}

#[test]
fn test_single_dash_long_flags() {
    let config = Configuration::load_from(
        [
            "secret-agent-manager",
            "-debug",
            "-enable-leader-election=True",
            "-metrics-addr=127.0.0.1:9090",
            "-cert-dir",
            "/var/run/certs",
            "-cloud-secrets-namespace=cloud-credentials",
        ],
        None,
    )
    .unwrap();

    assert!(config.debug);
    assert!(config.enable_leader_election);
    assert_eq!(
        config.metrics_addr,
        MetricsAddress::Bind("127.0.0.1:9090".parse().unwrap())
    );
    assert_eq!(config.cert_dir, PathBuf::from("/var/run/certs"));
    assert_eq!(
        config.cloud_secrets_namespace.as_deref(),
        Some("cloud-credentials")
    );
}

#[test]
fn test_metrics_can_be_disabled() {
    let config =
        Configuration::load_from(["secret-agent-manager", "--metrics-addr=0"], None).unwrap();
    assert_eq!(config.metrics_addr, MetricsAddress::Disabled);
    assert!(config.metrics_addr.socket_addr().is_none());
}

#[test]
fn test_malformed_flags_are_rejected() {
    for args in [
        vec!["secret-agent-manager", "--metrics-addr=8080"],
        vec!["secret-agent-manager", "--health-addr=no-such-host.invalid:8081"],
        vec!["secret-agent-manager", "--health-addr=:99999"],
        vec!["secret-agent-manager", "--debug=maybe"],
        vec!["secret-agent-manager", "-debug=yes"],
        vec!["secret-agent-manager", "--no-such-flag"],
    ] {
        assert!(
            Configuration::load_from(args.clone(), None).is_err(),
            "expected {args:?} to be rejected"
        );
    }
}

#[test]
fn test_only_literal_false_disables_webhooks() {
    let load = |value: Option<&str>| {
        Configuration::load_from(["secret-agent-manager"], value)
            .unwrap()
            .webhooks_enabled
    };
    assert!(!load(Some("false")));
    assert!(load(Some("False")));
    assert!(load(Some("no")));
    assert!(load(Some("")));
    assert!(load(None));
}
