use std::fmt;

use chrono::{DateTime, Utc};

/// Reason an authorization check refused the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// An API token lacks the scope or type an endpoint requires.
    TokenScope,
    /// Endpoint is reserved for browser sessions.
    SessionRequired,
    /// An API token was presented from outside its IP allowlist. Callers
    /// answer this as an authentication failure.
    TokenIpNotAllowed,
    /// A setup token is configured and the request did not present it.
    SetupTokenRequired,
    /// No setup token is configured and the request is not from loopback.
    SetupLocalhostOnly,
    AlreadyInitialized,
}

impl Denied {
    pub fn code(self) -> &'static str {
        match self {
            Self::TokenScope => "api_token_scope_denied",
            Self::SessionRequired => "session_required",
            Self::TokenIpNotAllowed => "api_token_ip_denied",
            Self::SetupTokenRequired => "setup_token_required",
            Self::SetupLocalhostOnly => "setup_localhost_only",
            Self::AlreadyInitialized => "system_already_initialized",
        }
    }
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::TokenScope => "insufficient api token scope",
            Self::SessionRequired => "a browser session is required",
            Self::TokenIpNotAllowed => "api token not allowed from this address",
            Self::SetupTokenRequired => "setup token required",
            Self::SetupLocalhostOnly => "setup is only allowed from localhost",
            Self::AlreadyInitialized => "system already initialized",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Ceremony,
    Passkey,
    ApiToken,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ceremony => "passkey ceremony",
            Self::Passkey => "passkey",
            Self::ApiToken => "api token",
        })
    }
}

/// Errors produced by the auth subsystem. Match on the variant, never on
/// the message.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error("too many login attempts")]
    RateLimited { unlock_at: DateTime<Utc> },

    #[error("{0}")]
    Forbidden(Denied),

    #[error("{0} not found")]
    NotFound(Resource),

    #[error("{0}")]
    Invalid(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Store or library failure. The source is logged, never returned to
    /// the caller.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AuthError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalid_credentials",
            Self::RateLimited { .. } => "too_many_login_attempts",
            Self::Forbidden(denied) => denied.code(),
            Self::NotFound(Resource::Ceremony) => "passkey_session_not_found",
            Self::NotFound(Resource::Passkey) => "passkey_not_found",
            Self::NotFound(Resource::ApiToken) => "token_not_found",
            Self::Invalid(_) => "invalid_request",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;
