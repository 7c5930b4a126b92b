//! Config schema types (server, database, auth, client IP resolution, passkeys).
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration for the AnzuImg server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnzuConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub client_ip: ClientIpConfig,
    pub passkey: PasskeyConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:anzuimg.db?mode=rwc".into(),
        }
    }
}

/// Session, bootstrap and lockout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Total lifetime of a browser session. Renewed on use once less than
    /// half of it remains.
    pub session_ttl_secs: u64,
    /// Revoke a session when it is presented from an IP other than the one
    /// that created it.
    pub strict_session_ip: bool,
    pub cookie_same_site: SameSitePolicy,
    /// Token required by the first-run setup endpoint. When unset, setup is
    /// only accepted from loopback addresses.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub setup_token: Option<Secret<String>>,
    /// How often expired sessions, stale login attempts and abandoned
    /// passkey ceremonies are swept.
    pub sweep_interval_secs: u64,
    pub lockout: LockoutConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 8 * 60 * 60,
            strict_session_ip: false,
            cookie_same_site: SameSitePolicy::default(),
            setup_token: None,
            sweep_interval_secs: 60 * 60,
            lockout: LockoutConfig::default(),
        }
    }
}

/// Password-login brute-force protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Failed attempts within `window_secs` that lock an IP.
    pub threshold: u32,
    pub window_secs: u64,
    /// Login attempts older than this are deleted by the sweeper.
    pub retention_secs: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 15 * 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

/// How the caller IP is derived from the peer address and proxy headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIpConfig {
    /// CIDR ranges or bare addresses allowed to assert a forwarded client IP.
    pub trusted_proxies: Vec<String>,
    /// Headers consulted in order once the peer is trusted.
    pub headers: Vec<String>,
    pub strategy: ClientIpStrategy,
}

pub const DEFAULT_TRUSTED_PROXIES: &[&str] = &[
    "127.0.0.1",
    "::1",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

pub const DEFAULT_CLIENT_IP_HEADERS: &[&str] = &["X-Forwarded-For", "X-Real-IP"];

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: DEFAULT_TRUSTED_PROXIES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            headers: DEFAULT_CLIENT_IP_HEADERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            strategy: ClientIpStrategy::default(),
        }
    }
}

/// Strategy used for `X-Forwarded-For`.
///
/// Parsing is lenient: unknown names fall back to [`ClientIpStrategy::TrustedChain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClientIpStrategy {
    /// Walk the header right to left and take the first hop that is not a
    /// trusted proxy.
    #[default]
    TrustedChain,
    /// Take the rightmost entry that parses as an IP.
    RightmostPublic,
}

impl ClientIpStrategy {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rightmost" | "right-most" | "last" => Self::RightmostPublic,
            _ => Self::TrustedChain,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrustedChain => "trusted",
            Self::RightmostPublic => "rightmost",
        }
    }
}

impl From<String> for ClientIpStrategy {
    fn from(value: String) -> Self {
        Self::from_name(&value)
    }
}

impl From<ClientIpStrategy> for String {
    fn from(value: ClientIpStrategy) -> Self {
        value.as_str().to_string()
    }
}

/// `SameSite` attribute of the session cookie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    /// Cross-site cookie; always paired with `Secure`.
    None,
}

impl SameSitePolicy {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "strict" => Self::Strict,
            "none" => Self::None,
            _ => Self::Lax,
        }
    }

    /// Attribute value as written in `Set-Cookie`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }
}

impl From<String> for SameSitePolicy {
    fn from(value: String) -> Self {
        Self::from_name(&value)
    }
}

impl From<SameSitePolicy> for String {
    fn from(value: SameSitePolicy) -> Self {
        value.as_str().to_ascii_lowercase()
    }
}

/// WebAuthn relying-party settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasskeyConfig {
    pub rp_id: String,
    pub rp_origin: String,
    pub rp_display_name: String,
    /// Lifetime of a begun-but-unfinished ceremony.
    pub ceremony_ttl_secs: u64,
}

impl Default for PasskeyConfig {
    fn default() -> Self {
        Self {
            rp_id: "localhost".into(),
            rp_origin: "http://localhost:8080".into(),
            rp_display_name: "AnzuImg".into(),
            ceremony_ttl_secs: 5 * 60,
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("", ClientIpStrategy::TrustedChain)]
    #[case("trusted", ClientIpStrategy::TrustedChain)]
    #[case("trusted-chain", ClientIpStrategy::TrustedChain)]
    #[case("standard", ClientIpStrategy::TrustedChain)]
    #[case("default", ClientIpStrategy::TrustedChain)]
    #[case("rightmost", ClientIpStrategy::RightmostPublic)]
    #[case("Right-Most", ClientIpStrategy::RightmostPublic)]
    #[case(" last ", ClientIpStrategy::RightmostPublic)]
    #[case("bogus", ClientIpStrategy::TrustedChain)]
    fn strategy_names(#[case] name: &str, #[case] expected: ClientIpStrategy) {
        assert_eq!(ClientIpStrategy::from_name(name), expected);
    }

    #[rstest]
    #[case("lax", SameSitePolicy::Lax)]
    #[case("STRICT", SameSitePolicy::Strict)]
    #[case("None", SameSitePolicy::None)]
    #[case("", SameSitePolicy::Lax)]
    #[case("sideways", SameSitePolicy::Lax)]
    fn same_site_names(#[case] name: &str, #[case] expected: SameSitePolicy) {
        assert_eq!(SameSitePolicy::from_name(name), expected);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AnzuConfig::default();
        assert_eq!(cfg.auth.session_ttl_secs, 28_800);
        assert_eq!(cfg.auth.lockout.threshold, 5);
        assert_eq!(cfg.auth.lockout.window_secs, 900);
        assert_eq!(cfg.auth.lockout.retention_secs, 86_400);
        assert_eq!(cfg.passkey.ceremony_ttl_secs, 300);
        assert_eq!(cfg.client_ip.headers, vec!["X-Forwarded-For", "X-Real-IP"]);
        assert_eq!(cfg.client_ip.trusted_proxies.len(), 5);
        assert!(cfg.auth.setup_token.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AnzuConfig = toml::from_str(
            r#"
            [auth]
            strict_session_ip = true
            cookie_same_site = "none"
            setup_token = "s3cret"

            [client_ip]
            strategy = "rightmost"
            "#,
        )
        .unwrap();
        assert!(cfg.auth.strict_session_ip);
        assert_eq!(cfg.auth.cookie_same_site, SameSitePolicy::None);
        assert_eq!(
            cfg.auth.setup_token.as_ref().map(|s| s.expose_secret().as_str()),
            Some("s3cret")
        );
        assert_eq!(cfg.auth.session_ttl_secs, 28_800);
        assert_eq!(cfg.client_ip.strategy, ClientIpStrategy::RightmostPublic);
        assert_eq!(cfg.client_ip.headers.len(), 2);
    }
}
