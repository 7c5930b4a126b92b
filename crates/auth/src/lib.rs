//! Authentication and access control.
//!
//! - [`ClientIpResolver`]: trustworthy caller IP from the peer address and
//!   proxy headers
//! - [`CredentialStore`]: password, sessions, API tokens and passkeys in SQLite
//! - [`PasskeyCoordinator`]: WebAuthn ceremony state around a
//!   [`CeremonyVerifier`]
//! - [`LoginDefenseMonitor`]: per-IP lockout for password login
//! - [`AuthorizationGate`]: the per-request decision and its guards
//!
//! Exactly one administrative principal exists ([`PrincipalId::ADMIN`]).

pub mod audit;
pub mod challenge;
pub mod client_ip;
mod clock;
pub mod credential_store;
pub mod device;
pub mod error;
pub mod gate;
pub mod locality;
pub mod login_defense;
pub mod paging;
pub mod passkey;
pub mod principal;
pub mod scope;
pub mod sweeper;
pub mod webauthn;

pub use {
    audit::{RequestInfo, SecurityAuditLog, SecurityEvent, SecurityEventRecord, Severity},
    client_ip::{ClientIpError, ClientIpResolver},
    credential_store::{
        ApiToken, CreatedToken, CredentialStore, NewPasskey, NewSession, PasskeyCredential,
        Session, SessionPolicy, TOKEN_PREFIX, TokenActivity, TokenLogEntry,
    },
    error::{AuthError, Denied, Resource},
    gate::{AuthIdentity, AuthorizationGate, SESSION_COOKIE, extract_credential, parse_cookie},
    locality::{authorize_setup, is_loopback},
    login_defense::{LockoutPolicy, LoginDefenseMonitor},
    paging::{Page, Paged},
    passkey::{Ceremony, CeremonyVerifier, PasskeyCoordinator, VerifiedAssertion},
    principal::{AuthMethod, ClientContext, PrincipalId},
    scope::{Scope, TokenType},
    sweeper::{Sweep, spawn_sweeper},
    webauthn::{WebauthnCoordinator, WebauthnVerifier},
};
