//! Per-request authorization decision.
//!
//! A request is authenticated by a browser session or, failing that, by an API
//! token presented in the same slot. Guards then narrow what the caller may do.
//! Token scope and type guards only bind API tokens: a session passes them.

use std::{net::IpAddr, sync::Arc};

use {
    axum::http::{HeaderMap, header},
    tracing::debug,
};

use crate::{
    credential_store::{ApiToken, CredentialStore, Session},
    error::{AuthError, Denied, Result},
    principal::{AuthMethod, PrincipalId},
    scope::{Scope, TokenType},
};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "anzuimg_session";

/// Alternate header carrying a session token.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Parse a specific cookie value from a Cookie header string.
pub fn parse_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(name)
            && let Some(value) = value.strip_prefix('=')
        {
            return Some(value);
        }
    }
    None
}

/// The credential a request presents: session cookie, then
/// `Authorization: Bearer`, then `X-Session-Token`. Empty values are skipped.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|h| parse_cookie(h, SESSION_COOKIE));
    let from_bearer = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    };
    let from_custom = || {
        headers
            .get(SESSION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
    };

    [from_cookie, from_bearer(), from_custom()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
}

/// Who the caller is and how they proved it.
#[derive(Debug, Clone)]
pub enum AuthIdentity {
    Session(Session),
    ApiToken(ApiToken),
}

impl AuthIdentity {
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Session(_) => AuthMethod::Session,
            Self::ApiToken(_) => AuthMethod::ApiToken,
        }
    }

    pub fn principal(&self) -> PrincipalId {
        match self {
            Self::Session(s) => s.principal,
            Self::ApiToken(t) => t.principal,
        }
    }

    pub fn api_token(&self) -> Option<&ApiToken> {
        match self {
            Self::ApiToken(t) => Some(t),
            Self::Session(_) => None,
        }
    }

    /// Browser-only endpoints.
    pub fn require_session(&self) -> Result<&Session> {
        match self {
            Self::Session(s) => Ok(s),
            Self::ApiToken(_) => Err(AuthError::Forbidden(Denied::SessionRequired)),
        }
    }

    /// The token must grant at least one of `scopes`.
    pub fn require_any_scope(&self, scopes: &[Scope]) -> Result<()> {
        match self {
            Self::Session(_) => Ok(()),
            Self::ApiToken(t) if scopes.iter().any(|s| t.token_type.grants(*s)) => Ok(()),
            Self::ApiToken(_) => Err(AuthError::Forbidden(Denied::TokenScope)),
        }
    }

    /// The token's type must be one of `allowed`.
    pub fn require_token_type(&self, allowed: &[TokenType]) -> Result<()> {
        match self {
            Self::Session(_) => Ok(()),
            Self::ApiToken(t) if allowed.contains(&t.token_type) => Ok(()),
            Self::ApiToken(_) => Err(AuthError::Forbidden(Denied::TokenScope)),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationGate {
    store: Arc<CredentialStore>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn authorize(&self, headers: &HeaderMap, client_ip: IpAddr) -> Result<AuthIdentity> {
        let credential = extract_credential(headers).ok_or(AuthError::InvalidCredential)?;
        self.authorize_credential(credential, client_ip).await
    }

    /// Session first, then API token. Store failures are not downgraded to
    /// an authentication failure.
    pub async fn authorize_credential(
        &self,
        credential: &str,
        client_ip: IpAddr,
    ) -> Result<AuthIdentity> {
        match self.store.validate_session(credential, client_ip).await {
            Ok(session) => return Ok(AuthIdentity::Session(session)),
            Err(AuthError::InvalidCredential) => {},
            Err(e) => return Err(e),
        }
        match self.store.validate_token(credential, client_ip).await {
            Ok(token) => Ok(AuthIdentity::ApiToken(token)),
            Err(e) => {
                debug!(ip = %client_ip, "request presented no valid session or api token");
                Err(e)
            },
        }
    }
}
