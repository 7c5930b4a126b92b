//! Append-only security event log.
//!
//! Writing an event never fails the request that produced it: store errors
//! are logged and swallowed.

use std::{net::IpAddr, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
    tracing::warn,
};

use crate::{
    clock::{before, from_millis, to_millis},
    error::Result,
    paging::{Page, Paged},
    principal::ADMIN_USERNAME,
};

pub const AUTH_CATEGORY: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    fn from_stored(value: &str) -> Self {
        match value {
            "warning" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Where a request came from and what it asked for.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub ip: IpAddr,
    pub method: String,
    pub path: String,
}

impl RequestInfo {
    pub fn new(ip: IpAddr, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip,
            method: method.into(),
            path: path.into(),
        }
    }
}

/// An event about to be written.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub severity: Severity,
    pub action: String,
    pub message: String,
    pub method: String,
    pub path: String,
    pub ip_address: String,
}

impl SecurityEvent {
    pub fn new(severity: Severity, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            action: action.into(),
            message: message.into(),
            method: String::new(),
            path: String::new(),
            ip_address: String::new(),
        }
    }

    pub fn info(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, action, message)
    }

    pub fn warning(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, action, message)
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, action, message)
    }

    #[must_use]
    pub fn with_request(mut self, request: &RequestInfo) -> Self {
        self.method.clone_from(&request.method);
        self.path.clone_from(&request.path);
        self.ip_address = request.ip.to_canonical().to_string();
        self
    }
}

/// A stored event.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEventRecord {
    pub id: i64,
    pub category: String,
    pub level: Severity,
    pub action: String,
    pub message: String,
    pub method: String,
    pub path: String,
    pub ip_address: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

type EventRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
);

pub struct SecurityAuditLog {
    pool: SqlitePool,
}

impl SecurityAuditLog {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS security_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                level TEXT NOT NULL,
                action TEXT NOT NULL,
                message TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL DEFAULT '',
                ip_address TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_security_events_action_ip
             ON security_events (action, ip_address, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record(&self, event: &SecurityEvent) {
        self.record_at(event, Utc::now()).await;
    }

    pub async fn record_at(&self, event: &SecurityEvent, now: DateTime<Utc>) {
        let result = sqlx::query(
            "INSERT INTO security_events
                (category, level, action, message, method, path, ip_address, username, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(AUTH_CATEGORY)
        .bind(event.severity.as_str())
        .bind(&event.action)
        .bind(&event.message)
        .bind(&event.method)
        .bind(&event.path)
        .bind(&event.ip_address)
        .bind(ADMIN_USERNAME)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(action = %event.action, error = %e, "failed to write security event");
        }
    }

    pub async fn record_deduplicated(&self, event: &SecurityEvent, window: Duration) -> bool {
        self.record_deduplicated_at(event, window, Utc::now()).await
    }

    /// Write `event` unless one with the same action and IP was written within
    /// `window`. Returns whether a row was written.
    pub async fn record_deduplicated_at(
        &self,
        event: &SecurityEvent,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let result = sqlx::query(
            "INSERT INTO security_events
                (category, level, action, message, method, path, ip_address, username, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (
                SELECT 1 FROM security_events
                WHERE action = ? AND ip_address = ? AND created_at > ?
             )",
        )
        .bind(AUTH_CATEGORY)
        .bind(event.severity.as_str())
        .bind(&event.action)
        .bind(&event.message)
        .bind(&event.method)
        .bind(&event.path)
        .bind(&event.ip_address)
        .bind(ADMIN_USERNAME)
        .bind(to_millis(now))
        .bind(&event.action)
        .bind(&event.ip_address)
        .bind(to_millis(before(now, window)))
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(e) => {
                warn!(action = %event.action, error = %e, "failed to write security event");
                false
            },
        }
    }

    /// Newest first. `failed_only` keeps warnings and errors.
    pub async fn list(&self, page: Page, failed_only: bool) -> Result<Paged<SecurityEventRecord>> {
        let filter = if failed_only {
            "WHERE level IN ('warning', 'error')"
        } else {
            ""
        };
        let (total,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM security_events {filter}"))
                .fetch_one(&self.pool)
                .await?;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT id, category, level, action, message, method, path, ip_address, username, created_at
             FROM security_events {filter}
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(
                |(id, category, level, action, message, method, path, ip_address, username, created_at)| {
                    SecurityEventRecord {
                        id,
                        category,
                        level: Severity::from_stored(&level),
                        action,
                        message,
                        method,
                        path,
                        ip_address,
                        username,
                        created_at: from_millis(created_at),
                    }
                },
            )
            .collect();
        Ok(Paged {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }
}
