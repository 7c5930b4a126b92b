use std::{fmt, net::IpAddr};

use {
    chrono::{DateTime, TimeDelta, Utc},
    ipnet::IpNet,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    clock::{from_millis, to_millis},
    error::{AuthError, Denied, Resource, Result},
    paging::{Page, Paged},
    principal::PrincipalId,
    scope::{Scope, TokenType},
};

use super::{CredentialStore, generate_token, hash_token};

/// Every raw API token starts with this marker.
pub const TOKEN_PREFIX: &str = "anz_";

/// Characters of the raw token kept for display (`anz_` plus eight).
const DISPLAY_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct ApiToken {
    pub id: i64,
    pub principal: PrincipalId,
    pub name: String,
    pub token_prefix: String,
    pub token_type: TokenType,
    pub ip_allowlist: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
}

impl ApiToken {
    pub fn scopes(&self) -> &'static [Scope] {
        self.token_type.scopes()
    }
}

/// A new token together with its raw value, which is never retrievable again.
#[derive(Clone)]
pub struct CreatedToken {
    pub token: ApiToken,
    pub raw: String,
}

impl fmt::Debug for CreatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedToken")
            .field("token", &self.token)
            .field("raw", &"[REDACTED]")
            .finish()
    }
}

/// One line of the token activity log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenActivity {
    pub token_id: i64,
    pub token_name: String,
    pub token_type: String,
    pub action: String,
    pub method: String,
    pub path: String,
    pub ip_address: String,
    pub user_agent: String,
}

impl TokenActivity {
    pub fn new(token: &ApiToken, action: impl Into<String>) -> Self {
        Self {
            token_id: token.id,
            token_name: token.name.clone(),
            token_type: token.token_type.as_str().to_string(),
            action: action.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub activity: TokenActivity,
    pub created_at: DateTime<Utc>,
}

type TokenRow = (
    i64,
    i64,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
);

const TOKEN_COLUMNS: &str = "id, principal_id, name, token_prefix, token_type, ip_allowlist, \
                             created_at, last_used_at, last_used_ip";

fn token_from_row(row: TokenRow) -> Result<ApiToken> {
    let (
        id,
        principal_id,
        name,
        token_prefix,
        token_type,
        ip_allowlist,
        created_at,
        last_used_at,
        last_used_ip,
    ) = row;
    let token_type = TokenType::from_name(&token_type)
        .map_err(|_| anyhow::anyhow!("api token {id} has unknown type {token_type:?}"))?;
    let ip_allowlist: Vec<String> = serde_json::from_str(&ip_allowlist)
        .map_err(|e| anyhow::anyhow!("api token {id} has a malformed allowlist: {e}"))?;
    Ok(ApiToken {
        id,
        principal: PrincipalId::from_row(principal_id),
        name,
        token_prefix,
        token_type,
        ip_allowlist,
        created_at: from_millis(created_at),
        last_used_at: last_used_at.map(from_millis),
        last_used_ip,
    })
}

impl CredentialStore {
    // ── API tokens ───────────────────────────────────────────────────────

    pub async fn create_token(
        &self,
        principal: PrincipalId,
        name: &str,
        token_type: TokenType,
        ip_allowlist: &[String],
    ) -> Result<CreatedToken> {
        self.create_token_at(principal, name, token_type, ip_allowlist, Utc::now())
            .await
    }

    /// Issue a token. The raw value is returned once; only its hash is kept.
    pub async fn create_token_at(
        &self,
        principal: PrincipalId,
        name: &str,
        token_type: TokenType,
        ip_allowlist: &[String],
        now: DateTime<Utc>,
    ) -> Result<CreatedToken> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::invalid("token name is required"));
        }
        let ip_allowlist = normalize_allowlist(ip_allowlist)?;
        let allowlist_json = serde_json::to_string(&ip_allowlist).map_err(anyhow::Error::from)?;

        let raw = format!("{TOKEN_PREFIX}{}", generate_token());
        let token_prefix = raw[..DISPLAY_PREFIX_LEN].to_string();

        let id = sqlx::query(
            "INSERT INTO api_tokens
                (principal_id, name, token_hash, token_prefix, token_type, ip_allowlist, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(principal.as_i64())
        .bind(name)
        .bind(hash_token(&raw))
        .bind(&token_prefix)
        .bind(token_type.as_str())
        .bind(&allowlist_json)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!(token_id = id, token_type = token_type.as_str(), "api token created");
        Ok(CreatedToken {
            token: ApiToken {
                id,
                principal,
                name: name.to_string(),
                token_prefix,
                token_type,
                ip_allowlist,
                created_at: now,
                last_used_at: None,
                last_used_ip: None,
            },
            raw,
        })
    }

    pub async fn list_tokens(&self) -> Result<Vec<ApiToken>> {
        let rows: Vec<TokenRow> = sqlx::query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(token_from_row).collect()
    }

    pub async fn get_token(&self, id: i64) -> Result<ApiToken> {
        let row: Option<TokenRow> =
            sqlx::query_as(&format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(token_from_row)
            .transpose()?
            .ok_or(AuthError::NotFound(Resource::ApiToken))
    }

    pub async fn delete_token(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(Resource::ApiToken));
        }
        Ok(())
    }

    pub async fn validate_token(&self, raw: &str, caller_ip: IpAddr) -> Result<ApiToken> {
        self.validate_token_at(raw, caller_ip, Utc::now()).await
    }

    /// Look up a token and enforce its IP allowlist. Recording the use is
    /// best-effort and never fails the call.
    pub async fn validate_token_at(
        &self,
        raw: &str,
        caller_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<ApiToken> {
        if !raw.starts_with(TOKEN_PREFIX) {
            return Err(AuthError::InvalidCredential);
        }
        let row: Option<TokenRow> = sqlx::query_as(&format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE token_hash = ?"
        ))
        .bind(hash_token(raw))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(AuthError::InvalidCredential);
        };
        let mut token = token_from_row(row)?;

        if !ip_allowed(&token.ip_allowlist, caller_ip) {
            warn!(token_id = token.id, ip = %caller_ip, "api token used outside its allowlist");
            return Err(AuthError::Forbidden(Denied::TokenIpNotAllowed));
        }

        let ip = caller_ip.to_canonical().to_string();
        if let Err(e) = self.touch_token(token.id, &ip, now).await {
            warn!(token_id = token.id, error = %e, "failed to record api token use");
        }
        token.last_used_at = Some(now);
        token.last_used_ip = Some(ip);
        Ok(token)
    }

    async fn touch_token(&self, id: i64, ip: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET last_used_at = ?, last_used_ip = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(ip)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Token activity log ───────────────────────────────────────────────

    /// Append to the activity log. Failures are logged and swallowed.
    pub async fn record_token_activity(&self, activity: &TokenActivity) {
        self.record_token_activity_at(activity, Utc::now()).await;
    }

    pub async fn record_token_activity_at(&self, activity: &TokenActivity, now: DateTime<Utc>) {
        let result = sqlx::query(
            "INSERT INTO api_token_logs
                (token_id, token_name, token_type, action, method, path, ip_address, user_agent, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(activity.token_id)
        .bind(&activity.token_name)
        .bind(&activity.token_type)
        .bind(&activity.action)
        .bind(&activity.method)
        .bind(&activity.path)
        .bind(&activity.ip_address)
        .bind(&activity.user_agent)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(token_id = activity.token_id, action = %activity.action, error = %e, "failed to write api token log");
        }
    }

    pub async fn list_token_logs(&self, page: Page) -> Result<Paged<TokenLogEntry>> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_token_logs")
            .fetch_one(&self.pool)
            .await?;
        let rows: Vec<(i64, i64, String, String, String, String, String, String, String, i64)> =
            sqlx::query_as(
                "SELECT id, token_id, token_name, token_type, action, method, path, ip_address, user_agent, created_at
                 FROM api_token_logs ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .into_iter()
            .map(
                |(
                    id,
                    token_id,
                    token_name,
                    token_type,
                    action,
                    method,
                    path,
                    ip_address,
                    user_agent,
                    created_at,
                )| TokenLogEntry {
                    id,
                    activity: TokenActivity {
                        token_id,
                        token_name,
                        token_type,
                        action,
                        method,
                        path,
                        ip_address,
                        user_agent,
                    },
                    created_at: from_millis(created_at),
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

    pub async fn cleanup_token_logs(&self, older_than_days: u32) -> Result<u64> {
        self.cleanup_token_logs_at(older_than_days, Utc::now()).await
    }

    /// Delete log rows older than `older_than_days`. Zero days is rejected.
    pub async fn cleanup_token_logs_at(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if older_than_days == 0 {
            return Err(AuthError::invalid("days must be a positive number"));
        }
        let cutoff = now - TimeDelta::days(i64::from(older_than_days));
        let result = sqlx::query("DELETE FROM api_token_logs WHERE created_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Trim entries, drop blanks, and require each to be an address or a CIDR.
fn normalize_allowlist(entries: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let valid = if entry.contains('/') {
            entry.parse::<IpNet>().is_ok()
        } else {
            entry.parse::<IpAddr>().is_ok()
        };
        if !valid {
            return Err(AuthError::invalid(format!(
                "invalid ip allowlist entry: {entry}"
            )));
        }
        out.push(entry.to_string());
    }
    Ok(out)
}

/// Whether `ip` satisfies an allowlist. Empty means unrestricted; rules that
/// no longer parse are skipped.
pub fn ip_allowed(rules: &[String], ip: IpAddr) -> bool {
    if rules.is_empty() {
        return true;
    }
    let ip = ip.to_canonical();
    rules.iter().any(|rule| {
        if rule.contains('/') {
            rule.parse::<IpNet>().is_ok_and(|net| net.contains(&ip))
        } else {
            rule.parse::<IpAddr>()
                .is_ok_and(|allowed| allowed.to_canonical() == ip)
        }
    })
}
