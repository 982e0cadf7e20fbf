//! Name resolution checks.
//!
//! [`diagnose`] is the soft DNS stage of the health probe: it never fails, it
//! only records what the resolver returned. [`expect_resolves_to`] is the
//! strict form polled while waiting for a record to propagate to the load
//! balancer address.

use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tokio::net::lookup_host;

/// Port passed to the resolver; only the addresses are used.
const LOOKUP_PORT: u16 = 443;

/// DNS check errors.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS lookup failed for {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no IP addresses found for domain {host}")]
    NoAddresses { host: String },

    #[error("expected IP {expected} not found in DNS resolution for {host} (got {resolved:?})")]
    ExpectedIpMissing {
        host: String,
        expected: IpAddr,
        resolved: Vec<IpAddr>,
    },
}

/// Outcome of a soft DNS check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsDiagnostics {
    pub host: String,
    pub resolved: Vec<IpAddr>,
    /// Resolver error message, if the lookup failed.
    pub error: Option<String>,
    pub expected_ip: Option<IpAddr>,
}

impl DnsDiagnostics {
    /// Whether the expected IP was among the resolved addresses.
    ///
    /// `None` when no expected IP was supplied.
    pub fn expected_ip_matched(&self) -> Option<bool> {
        self.expected_ip.map(|ip| self.resolved.contains(&ip))
    }
}

/// Resolve `host` to its distinct IP addresses, in resolver order.
pub async fn resolve(host: &str) -> Result<Vec<IpAddr>, DnsError> {
    let addrs = lookup_host((host, LOOKUP_PORT))
        .await
        .map_err(|source| DnsError::Lookup {
            host: host.to_string(),
            source,
        })?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        let ip = addr.ip();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    Ok(ips)
}

/// Resolve `host` and record the result without failing.
pub async fn diagnose(host: &str, expected_ip: Option<IpAddr>) -> DnsDiagnostics {
    let mut diagnostics = DnsDiagnostics {
        host: host.to_string(),
        expected_ip,
        ..Default::default()
    };

    match resolve(host).await {
        Ok(ips) => {
            tracing::info!(
                target: "deploy_verify.dns",
                host = %host,
                resolved = ?ips,
                "DNS resolved"
            );
            diagnostics.resolved = ips;
        }
        Err(e) => {
            tracing::warn!(
                target: "deploy_verify.dns",
                host = %host,
                error = %e,
                "DNS lookup failed"
            );
            diagnostics.error = Some(e.to_string());
        }
    }

    match diagnostics.expected_ip_matched() {
        Some(true) => tracing::info!(
            target: "deploy_verify.dns",
            host = %host,
            expected_ip = ?expected_ip,
            "Load balancer IP matched"
        ),
        Some(false) => tracing::warn!(
            target: "deploy_verify.dns",
            host = %host,
            expected_ip = ?expected_ip,
            "Load balancer IP not among resolved addresses"
        ),
        None => {}
    }

    diagnostics
}

/// Resolve `host` and require `expected` among the addresses.
pub async fn expect_resolves_to(host: &str, expected: IpAddr) -> Result<Vec<IpAddr>, DnsError> {
    let resolved = resolve(host).await?;

    if resolved.is_empty() {
        return Err(DnsError::NoAddresses {
            host: host.to_string(),
        });
    }

    if !resolved.contains(&expected) {
        return Err(DnsError::ExpectedIpMissing {
            host: host.to_string(),
            expected,
            resolved,
        });
    }

    Ok(resolved)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ips = resolve("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec![LOOPBACK]);
    }

    #[tokio::test]
    async fn test_diagnose_records_match() {
        let diagnostics = diagnose("127.0.0.1", Some(LOOPBACK)).await;

        assert_eq!(diagnostics.resolved, vec![LOOPBACK]);
        assert_eq!(diagnostics.error, None);
        assert_eq!(diagnostics.expected_ip_matched(), Some(true));
    }

    #[tokio::test]
    async fn test_diagnose_records_mismatch_without_failing() {
        let other: IpAddr = "203.0.113.7".parse().unwrap();
        let diagnostics = diagnose("127.0.0.1", Some(other)).await;

        assert_eq!(diagnostics.resolved, vec![LOOPBACK]);
        assert_eq!(diagnostics.expected_ip_matched(), Some(false));
    }

    #[tokio::test]
    async fn test_diagnose_records_lookup_failure() {
        // .invalid is reserved and never resolves (RFC 2606)
        let diagnostics = diagnose("bridge.invalid", None).await;

        assert!(diagnostics.resolved.is_empty());
        assert!(diagnostics.error.is_some());
        assert_eq!(diagnostics.expected_ip_matched(), None);
    }

    #[tokio::test]
    async fn test_expect_resolves_to_missing_ip() {
        let other: IpAddr = "203.0.113.7".parse().unwrap();
        let err = expect_resolves_to("127.0.0.1", other).await.unwrap_err();

        match err {
            DnsError::ExpectedIpMissing {
                expected, resolved, ..
            } => {
                assert_eq!(expected, other);
                assert_eq!(resolved, vec![LOOPBACK]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expect_resolves_to_match() {
        let ips = expect_resolves_to("127.0.0.1", LOOPBACK).await.unwrap();
        assert_eq!(ips, vec![LOOPBACK]);
    }
}
