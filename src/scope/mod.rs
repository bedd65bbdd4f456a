//! Target scope
//!
//! Decides which hosts are eligible for interception. Patterns are written
//! in config as plain strings:
//!
//! - `identity.ic0.app` matches that host exactly
//! - `*.icp0.io` matches `icp0.io` and every subdomain
//! - `127.0.0.0/8` or `::1` matches IP hosts by address or CIDR range
//! - `re:<regex>` matches the host against a regular expression
//!
//! An empty scope makes every host eligible.

use std::net::IpAddr;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Invalid regex '{0}': {1}")]
    InvalidRegex(String, String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Empty host pattern")]
    Empty,
}

/// A single host pattern
#[derive(Debug, Clone)]
pub enum HostPattern {
    Exact(String),
    Domain(String),
    IpRange { network: IpAddr, prefix_len: u8 },
    Regex(Regex),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self, ScopeError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ScopeError::Empty);
        }

        if let Some(expr) = pattern.strip_prefix("re:") {
            let re = Regex::new(expr)
                .map_err(|e| ScopeError::InvalidRegex(expr.to_string(), e.to_string()))?;
            return Ok(HostPattern::Regex(re));
        }

        if let Some(domain) = pattern.strip_prefix("*.") {
            return Ok(HostPattern::Domain(domain.to_ascii_lowercase()));
        }

        if let Some((network, prefix)) = pattern.split_once('/') {
            let network =
                IpAddr::from_str(network).map_err(|_| ScopeError::InvalidCidr(pattern.to_string()))?;
            let prefix_len: u8 = prefix
                .parse()
                .map_err(|_| ScopeError::InvalidCidr(pattern.to_string()))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            if prefix_len > max {
                return Err(ScopeError::InvalidCidr(pattern.to_string()));
            }
            return Ok(HostPattern::IpRange { network, prefix_len });
        }

        if let Ok(ip) = IpAddr::from_str(pattern) {
            let prefix_len = if ip.is_ipv4() { 32 } else { 128 };
            return Ok(HostPattern::IpRange {
                network: ip,
                prefix_len,
            });
        }

        Ok(HostPattern::Exact(pattern.to_ascii_lowercase()))
    }

    /// Match against an already-lowercased host
    pub fn matches_host(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(expected) => host == expected,
            HostPattern::Domain(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
            HostPattern::IpRange { network, prefix_len } => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                IpAddr::from_str(host)
                    .map(|ip| in_range(ip, *network, *prefix_len))
                    .unwrap_or(false)
            }
            HostPattern::Regex(re) => re.is_match(host),
        }
    }
}

fn in_range(host: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (host, network) {
        (IpAddr::V4(host), IpAddr::V4(network)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                !0u32 << (32 - prefix_len)
            };
            (u32::from(host) & mask) == (u32::from(network) & mask)
        }
        (IpAddr::V6(host), IpAddr::V6(network)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                !0u128 << (128 - prefix_len)
            };
            (u128::from(host) & mask) == (u128::from(network) & mask)
        }
        _ => false,
    }
}

/// The set of hosts eligible for interception
#[derive(Debug, Clone, Default)]
pub struct TargetScope {
    patterns: Vec<HostPattern>,
}

impl TargetScope {
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ScopeError> {
        let patterns = patterns
            .iter()
            .map(|p| HostPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Every host is eligible
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_host_in_scope(&self, host: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches_host(&host))
    }

    /// URLs that do not parse or carry no host are out of a non-empty scope
    pub fn is_in_scope(&self, url: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.is_host_in_scope(h)))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
