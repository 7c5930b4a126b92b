//! SQLite-backed credentials for the administrative principal: password,
//! sessions, API tokens and passkeys.
//!
//! Raw tokens never touch the database. Sessions and API tokens are looked up
//! by the SHA-512 hex digest of the value the client presents.

mod api_tokens;
mod passkeys;
mod password;
mod sessions;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use {
    anzuimg_config::AuthConfig,
    sha2::{Digest, Sha512},
    sqlx::SqlitePool,
};

pub use {
    api_tokens::{ApiToken, CreatedToken, TOKEN_PREFIX, TokenActivity, TokenLogEntry, ip_allowed},
    passkeys::{NewPasskey, PasskeyCredential},
    password::validate_password_strength,
    sessions::{NewSession, Session},
};

/// Session lifetime rules.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Total lifetime of a fresh session. Sessions are renewed to a full TTL
    /// once less than half of it remains.
    pub ttl: Duration,
    /// Revoke a session the moment it is presented from a different IP than
    /// the one that created it.
    pub strict_ip: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8 * 60 * 60),
            strict_ip: false,
        }
    }
}

impl SessionPolicy {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.session_ttl_secs),
            strict_ip: config.strict_session_ip,
        }
    }
}

pub struct CredentialStore {
    pool: SqlitePool,
    policy: SessionPolicy,
    initialized: AtomicBool,
}

impl CredentialStore {
    /// Create the store and its tables.
    pub async fn new(pool: SqlitePool, policy: SessionPolicy) -> anyhow::Result<Self> {
        let store = Self {
            pool,
            policy,
            initialized: AtomicBool::new(false),
        };
        store.init().await?;
        let has = store.has_password().await?;
        store.initialized.store(has, Ordering::Relaxed);
        Ok(store)
    }

    pub fn session_policy(&self) -> SessionPolicy {
        self.policy
    }

    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth_password (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT NOT NULL UNIQUE,
                principal_id INTEGER NOT NULL,
                ip_address TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_auth_sessions_principal ON auth_sessions (principal_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                token_prefix TEXT NOT NULL,
                token_type TEXT NOT NULL,
                ip_allowlist TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                last_used_ip TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_token_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_id INTEGER NOT NULL,
                token_name TEXT NOT NULL,
                token_type TEXT NOT NULL,
                action TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL DEFAULT '',
                ip_address TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS passkeys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_id INTEGER NOT NULL,
                credential_id TEXT NOT NULL UNIQUE,
                passkey_data BLOB NOT NULL,
                attestation_type TEXT NOT NULL DEFAULT '',
                sign_count INTEGER NOT NULL DEFAULT 0,
                device_name TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                ip_address TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// 256 bits from the OS RNG, base64url without padding.
pub(crate) fn generate_token() -> String {
    use {base64::Engine, rand::RngCore};

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn hash_token(raw: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}
