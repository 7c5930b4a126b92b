//! Per-IP brute-force protection for password login.
//!
//! Failures are counted over a sliding window. A success does not reset the
//! count: an IP unlocks only once its failures age out of the window.

use std::{net::IpAddr, sync::Arc, time::Duration};

use {
    anzuimg_config::LockoutConfig,
    chrono::{DateTime, Utc},
    sqlx::SqlitePool,
    tracing::warn,
};

use crate::{
    audit::{RequestInfo, SecurityAuditLog, SecurityEvent},
    clock::{after, before, from_millis, to_millis},
    error::{AuthError, Result},
    principal::ADMIN_USERNAME,
};

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub threshold: u32,
    pub window: Duration,
    /// How long attempt rows are kept at all.
    pub retention: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl LockoutPolicy {
    pub fn from_config(config: &LockoutConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            retention: Duration::from_secs(config.retention_secs),
        }
    }
}

pub struct LoginDefenseMonitor {
    pool: SqlitePool,
    audit: Arc<SecurityAuditLog>,
    policy: LockoutPolicy,
}

impl LoginDefenseMonitor {
    pub async fn new(
        pool: SqlitePool,
        audit: Arc<SecurityAuditLog>,
        policy: LockoutPolicy,
    ) -> anyhow::Result<Self> {
        let monitor = Self {
            pool,
            audit,
            policy,
        };
        monitor.init().await?;
        Ok(monitor)
    }

    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS login_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address TEXT NOT NULL,
                username TEXT NOT NULL,
                success INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_login_attempts_ip_created
             ON login_attempts (ip_address, success, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    /// When `ip` is locked, the moment it unlocks: the most recent failure in
    /// the window plus the window length.
    pub async fn locked_until_at(
        &self,
        ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (failures, latest) = self.failures_in_window(ip, now).await?;
        if failures < i64::from(self.policy.threshold) {
            return Ok(None);
        }
        let latest = latest.map_or(now, from_millis);
        Ok(Some(after(latest, self.policy.window)))
    }

    pub async fn check(&self, request: &RequestInfo) -> Result<()> {
        self.check_at(request, Utc::now()).await
    }

    /// Refuse a locked-out IP with [`AuthError::RateLimited`]. Refusals are
    /// audited at most once per window per IP.
    pub async fn check_at(&self, request: &RequestInfo, now: DateTime<Utc>) -> Result<()> {
        let Some(unlock_at) = self.locked_until_at(request.ip, now).await? else {
            return Ok(());
        };
        warn!(ip = %request.ip, %unlock_at, "login refused, ip locked out");
        let event = SecurityEvent::warning(
            "login_rate_limited",
            format!("login locked until {}", unlock_at.to_rfc3339()),
        )
        .with_request(request);
        self.audit
            .record_deduplicated_at(&event, self.policy.window, now)
            .await;
        Err(AuthError::RateLimited { unlock_at })
    }

    pub async fn record_attempt(&self, request: &RequestInfo, success: bool) -> Result<()> {
        self.record_attempt_at(request, success, Utc::now()).await
    }

    /// Record a login outcome. Crossing the threshold raises a bruteforce
    /// alert, deduplicated per IP per window.
    pub async fn record_attempt_at(
        &self,
        request: &RequestInfo,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO login_attempts (ip_address, username, success, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(ip_key(request.ip))
        .bind(ADMIN_USERNAME)
        .bind(success)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if success {
            return Ok(());
        }

        let (failures, _) = self.failures_in_window(request.ip, now).await?;
        if failures >= i64::from(self.policy.threshold) {
            let event = SecurityEvent::error(
                "login_bruteforce_alert",
                format!(
                    "{failures} failed login attempts within {} minutes",
                    self.policy.window.as_secs() / 60
                ),
            )
            .with_request(request);
            if self
                .audit
                .record_deduplicated_at(&event, self.policy.window, now)
                .await
            {
                warn!(ip = %request.ip, failures, "possible brute-force login attack");
            }
        }
        Ok(())
    }

    pub async fn prune(&self) -> Result<u64> {
        self.prune_at(Utc::now()).await
    }

    /// Delete attempts older than the retention period.
    pub async fn prune_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE created_at < ?")
            .bind(to_millis(before(now, self.policy.retention)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn failures_in_window(&self, ip: IpAddr, now: DateTime<Utc>) -> Result<(i64, Option<i64>)> {
        let row: (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MAX(created_at) FROM login_attempts
             WHERE ip_address = ? AND success = 0 AND created_at > ?",
        )
        .bind(ip_key(ip))
        .bind(to_millis(before(now, self.policy.window)))
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

fn ip_key(ip: IpAddr) -> String {
    ip.to_canonical().to_string()
}
