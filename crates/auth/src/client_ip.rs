//! Caller IP resolution.
//!
//! Forwarding headers are only honoured when the TCP peer is a trusted
//! proxy; any other peer is reported verbatim so clients cannot spoof their
//! address by sending `X-Forwarded-For` themselves.

use std::net::{IpAddr, SocketAddr};

use {
    anzuimg_config::{ClientIpConfig, ClientIpStrategy, schema::DEFAULT_CLIENT_IP_HEADERS},
    axum::http::{HeaderMap, HeaderName, header::FORWARDED},
    ipnet::IpNet,
    tracing::warn,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientIpError {
    #[error("invalid trusted proxy entry `{0}`")]
    InvalidTrustedProxy(String),
}

#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trusted: Vec<IpNet>,
    headers: Vec<HeaderName>,
    strategy: ClientIpStrategy,
}

impl ClientIpResolver {
    /// Build a resolver. Trusted entries may be CIDR ranges or bare
    /// addresses; any other entry is rejected.
    pub fn new<S: AsRef<str>>(
        trusted_proxies: &[S],
        headers: &[S],
        strategy: ClientIpStrategy,
    ) -> Result<Self, ClientIpError> {
        let trusted = trusted_proxies
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .map(parse_trusted_proxy)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            trusted,
            headers: normalize_headers(headers),
            strategy,
        })
    }

    pub fn from_config(config: &ClientIpConfig) -> Result<Self, ClientIpError> {
        Self::new(
            config.trusted_proxies.as_slice(),
            config.headers.as_slice(),
            config.strategy,
        )
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.trusted.iter().any(|net| net.contains(&ip))
    }

    pub fn resolve(&self, peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
        self.resolve_ip(peer.ip(), headers)
    }

    pub fn resolve_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let peer = peer.to_canonical();
        if !self.is_trusted(peer) {
            return peer;
        }

        self.headers
            .iter()
            .find_map(|name| {
                let value = joined_header(headers, name)?;
                self.resolve_header(name, &value)
            })
            .unwrap_or(peer)
    }

    fn resolve_header(&self, name: &HeaderName, value: &str) -> Option<IpAddr> {
        if name.as_str() == "x-forwarded-for" && self.strategy == ClientIpStrategy::RightmostPublic {
            return rightmost_ip(value);
        }
        self.first_untrusted_hop(value)
    }

    /// Scan right to left, skipping trusted hops. Stops at the first entry
    /// that is not an address.
    fn first_untrusted_hop(&self, value: &str) -> Option<IpAddr> {
        let items: Vec<&str> = value.split(',').collect();
        for (i, item) in items.iter().enumerate().rev() {
            let ip = parse_ip(item)?;
            if i == 0 || !self.is_trusted(ip) {
                return Some(ip);
            }
        }
        None
    }
}

fn rightmost_ip(value: &str) -> Option<IpAddr> {
    value.split(',').rev().find_map(parse_ip)
}

/// Multiple header lines are treated as one comma-separated list.
fn joined_header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let joined = values.join(",");
    if joined.trim().is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Parse an address as it appears in a forwarding header. Accepts
/// `ip`, `ip:port` and `[v6]:port`; IPv4-mapped IPv6 is reported as IPv4.
pub fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip.to_canonical());
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip().to_canonical());
    }
    None
}

fn parse_trusted_proxy(entry: &str) -> Result<IpNet, ClientIpError> {
    if entry.contains('/') {
        return entry
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| ClientIpError::InvalidTrustedProxy(entry.to_string()));
    }
    entry
        .parse::<IpAddr>()
        .map(|ip| IpNet::from(ip.to_canonical()))
        .map_err(|_| ClientIpError::InvalidTrustedProxy(entry.to_string()))
}

/// Trim, drop invalid names and de-duplicate (header names compare
/// case-insensitively). Falls back to the default list when nothing remains.
fn normalize_headers<S: AsRef<str>>(headers: &[S]) -> Vec<HeaderName> {
    let mut out: Vec<HeaderName> = Vec::with_capacity(headers.len());
    for raw in headers {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        match HeaderName::from_bytes(raw.as_bytes()) {
            Ok(name) if name == FORWARDED => {
                warn!(header = raw, "RFC 7239 Forwarded header is not supported, ignoring");
            },
            Ok(name) => {
                if !out.contains(&name) {
                    out.push(name);
                }
            },
            Err(_) => warn!(header = raw, "ignoring invalid client IP header name"),
        }
    }
    if out.is_empty() {
        out = DEFAULT_CLIENT_IP_HEADERS
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
            .collect();
    }
    out
}
