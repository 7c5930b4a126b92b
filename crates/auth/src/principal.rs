use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Login name of the administrative principal, recorded on login attempts and
/// audit events.
pub const ADMIN_USERNAME: &str = "admin";

/// Display name presented to authenticators during passkey enrollment.
pub const ADMIN_DISPLAY_NAME: &str = "Administrator";

/// Owner of sessions, API tokens and passkeys.
///
/// Exactly one administrative principal exists: [`PrincipalId::ADMIN`]. The
/// id is still persisted on every owned row so ownership rules (one session
/// per principal, exclusion lists per principal) are expressed in the data
/// rather than assumed by call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(i64);

impl PrincipalId {
    pub const ADMIN: Self = Self(1);

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub(crate) fn from_row(id: i64) -> Self {
        Self(id)
    }
}

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Session,
    ApiToken,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::ApiToken => "api_token",
        }
    }
}

/// Where a request came from, as recorded on sessions and enrolled passkeys.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub ip: IpAddr,
    pub user_agent: String,
}

impl ClientContext {
    pub fn new(ip: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            ip,
            user_agent: user_agent.into(),
        }
    }
}
