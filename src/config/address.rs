//! # Bind Addresses
//!
//! Parsing of listener addresses in the `host:port` form used by the operator's
//! flags. An empty host (`:8080`) binds every interface. Host names are
//! resolved once, while the flags are parsed.

use super::ConfigError;
use crate::constants::METRICS_DISABLED;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Parse a `host:port` listener address
///
/// Accepts `:port`, `ip:port`, `[ipv6]:port` and `hostname:port`. A host name
/// binds its first resolved address; `localhost` is always `127.0.0.1`.
pub fn parse_bind_address(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if let Some(port) = value.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    if let Ok(addr) = SocketAddr::from_str(value) {
        return Ok(addr);
    }

    let Some((host, port)) = value.rsplit_once(':') else {
        return Err(invalid("missing port"));
    };
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    if host == "localhost" {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if host.is_empty() || host.contains(':') {
        return Err(invalid("expected an IP address or a host name"));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| invalid(&format!("{host} has no addresses")))
}

/// Where the metrics endpoint listens, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsAddress {
    /// `--metrics-addr=0`
    Disabled,
    Bind(SocketAddr),
}

impl MetricsAddress {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Disabled => None,
            Self::Bind(addr) => Some(*addr),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl FromStr for MetricsAddress {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim() == METRICS_DISABLED {
            return Ok(Self::Disabled);
        }
        parse_bind_address(value).map(Self::Bind)
    }
}

impl fmt::Display for MetricsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Bind(addr) => write!(f, "{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_host_binds_all_interfaces() {
        let addr = parse_bind_address(":8080").unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_explicit_hosts() {
        assert_eq!(
            parse_bind_address("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert_eq!(
            parse_bind_address("[::1]:9000").unwrap(),
            "[::1]:9000".parse().unwrap()
        );
        assert_eq!(
            parse_bind_address("localhost:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!(parse_bind_address("8080").is_err());
        assert!(parse_bind_address(":http").is_err());
        assert!(parse_bind_address(":70000").is_err());
        assert!(parse_bind_address("no-such-host.invalid:80").is_err());
        assert!(parse_bind_address("::1:80").is_err());
    }

    #[test]
    fn test_host_names_go_through_the_resolver() {
        let err = parse_bind_address("no-such-host.invalid:9000").unwrap_err();
        assert!(err.to_string().contains("no-such-host.invalid"), "{err}");
        assert!(!err.to_string().contains("invalid port"), "{err}");
    }

    #[test]
    fn test_metrics_zero_disables() {
        assert_eq!("0".parse::<MetricsAddress>().unwrap(), MetricsAddress::Disabled);
        assert!(MetricsAddress::Disabled.socket_addr().is_none());
    }

    #[test]
    fn test_metrics_bind() {
        let addr: MetricsAddress = ":8080".parse().unwrap();
        assert_eq!(addr.socket_addr(), Some("0.0.0.0:8080".parse().unwrap()));
        assert!(!addr.is_disabled());
    }
}
