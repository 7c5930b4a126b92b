use std::{fmt, net::IpAddr};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    clock::{after, from_millis, span, to_millis},
    error::{AuthError, Result},
    principal::{ClientContext, PrincipalId},
};

use super::{CredentialStore, generate_token, hash_token};

/// A persisted browser session. Carries no secret: the raw token only exists
/// in [`NewSession`].
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: i64,
    pub principal: PrincipalId,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A freshly minted session and the raw token to hand to the client.
#[derive(Clone)]
pub struct NewSession {
    pub token: String,
    pub session: Session,
}

impl fmt::Debug for NewSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSession")
            .field("token", &"[REDACTED]")
            .field("session", &self.session)
            .finish()
    }
}

type SessionRow = (i64, i64, String, String, i64, i64, i64);

fn session_from_row(row: SessionRow) -> Session {
    let (id, principal_id, ip_address, user_agent, created_at, expires_at, last_used_at) = row;
    Session {
        id,
        principal: PrincipalId::from_row(principal_id),
        ip_address,
        user_agent,
        created_at: from_millis(created_at),
        expires_at: from_millis(expires_at),
        last_used_at: from_millis(last_used_at),
    }
}

impl CredentialStore {
    // ── Sessions ─────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        principal: PrincipalId,
        client: &ClientContext,
    ) -> Result<NewSession> {
        self.create_session_at(principal, client, Utc::now()).await
    }

    /// Mint a session, revoking every other session of `principal` in the
    /// same transaction.
    pub async fn create_session_at(
        &self,
        principal: PrincipalId,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<NewSession> {
        let token = generate_token();
        let expires_at = after(now, self.policy.ttl);
        let ip_address = client.ip.to_canonical().to_string();

        let mut tx = self.pool.begin().await?;
        let revoked = sqlx::query("DELETE FROM auth_sessions WHERE principal_id = ?")
            .bind(principal.as_i64())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let id = sqlx::query(
            "INSERT INTO auth_sessions
                (token_hash, principal_id, ip_address, user_agent, created_at, expires_at, last_used_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(hash_token(&token))
        .bind(principal.as_i64())
        .bind(&ip_address)
        .bind(&client.user_agent)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        debug!(session_id = id, revoked, ip = %ip_address, "session created");
        Ok(NewSession {
            token,
            session: Session {
                id,
                principal,
                ip_address,
                user_agent: client.user_agent.clone(),
                created_at: now,
                expires_at,
                last_used_at: now,
            },
        })
    }

    pub async fn validate_session(&self, token: &str, caller_ip: IpAddr) -> Result<Session> {
        self.validate_session_at(token, caller_ip, Utc::now()).await
    }

    /// Look up a live session and renew it when less than half of the TTL
    /// remains. Under strict IP binding a session presented from another
    /// address is revoked.
    pub async fn validate_session_at(
        &self,
        token: &str,
        caller_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if token.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, principal_id, ip_address, user_agent, created_at, expires_at, last_used_at
             FROM auth_sessions WHERE token_hash = ? AND expires_at > ?",
        )
        .bind(hash_token(token))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(AuthError::InvalidCredential);
        };
        let mut session = session_from_row(row);

        let caller = caller_ip.to_canonical().to_string();
        if self.policy.strict_ip
            && !session.ip_address.is_empty()
            && session.ip_address != "unknown"
            && session.ip_address != caller
        {
            warn!(
                session_id = session.id,
                bound_ip = %session.ip_address,
                ip = %caller,
                "session presented from a different IP, revoking"
            );
            sqlx::query("DELETE FROM auth_sessions WHERE id = ?")
                .bind(session.id)
                .execute(&self.pool)
                .await?;
            return Err(AuthError::InvalidCredential);
        }

        let renewed = if session.expires_at - now < span(self.policy.ttl) / 2 {
            after(now, self.policy.ttl)
        } else {
            session.expires_at
        };
        match self.touch_session(session.id, renewed, now).await {
            Ok(()) => {
                session.expires_at = renewed;
                session.last_used_at = now;
            },
            Err(e) => warn!(session_id = session.id, error = %e, "failed to renew session"),
        }

        Ok(session)
    }

    async fn touch_session(
        &self,
        id: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE auth_sessions SET expires_at = ?, last_used_at = ? WHERE id = ?")
            .bind(to_millis(expires_at))
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the session behind `token`. Unknown tokens are not an error;
    /// the result says whether a session was removed.
    pub async fn revoke_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE token_hash = ?")
            .bind(hash_token(token))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke_all_sessions(&self, principal: PrincipalId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE principal_id = ?")
            .bind(principal.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        self.cleanup_expired_sessions_at(Utc::now()).await
    }

    pub async fn cleanup_expired_sessions_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ?")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    async fn stored_token_hashes(&self) -> Vec<String> {
        sqlx::query_as::<_, (String,)>("SELECT token_hash FROM auth_sessions")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(h,)| h)
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            clock::now_millis,
            credential_store::{SessionPolicy, tests::memory_store},
        },
        chrono::TimeDelta,
        std::time::Duration,
    };

    fn client(ip: &str) -> ClientContext {
        ClientContext::new(ip.parse().unwrap(), "Mozilla/5.0")
    }

    fn policy(strict_ip: bool) -> SessionPolicy {
        SessionPolicy {
            ttl: Duration::from_secs(8 * 3600),
            strict_ip,
        }
    }

    #[tokio::test]
    async fn only_the_hash_is_stored() {
        let store = memory_store(policy(false)).await;
        let created = store
            .create_session(PrincipalId::ADMIN, &client("10.0.0.1"))
            .await
            .unwrap();
        let hashes = store.stored_token_hashes().await;
        assert_eq!(hashes, vec![hash_token(&created.token)]);
        assert!(!hashes.contains(&created.token));
        assert!(!format!("{created:?}").contains(&created.token));
    }

    #[tokio::test]
    async fn new_session_revokes_previous() {
        let store = memory_store(policy(false)).await;
        let c = client("10.0.0.1");
        let first = store.create_session(PrincipalId::ADMIN, &c).await.unwrap();
        let second = store.create_session(PrincipalId::ADMIN, &c).await.unwrap();

        assert!(matches!(
            store.validate_session(&first.token, c.ip).await,
            Err(AuthError::InvalidCredential)
        ));
        let session = store.validate_session(&second.token, c.ip).await.unwrap();
        assert_eq!(session.id, second.session.id);
        assert_eq!(session.principal, PrincipalId::ADMIN);
    }

    #[tokio::test]
    async fn renews_only_past_half_life() {
        let store = memory_store(policy(false)).await;
        let c = client("10.0.0.1");
        let t0 = now_millis();
        let created = store
            .create_session_at(PrincipalId::ADMIN, &c, t0)
            .await
            .unwrap();
        let original_expiry = created.session.expires_at;

        // 3h in: 5h remain, at least half of 8h. Expiry stays.
        let at = t0 + TimeDelta::hours(3);
        let s = store
            .validate_session_at(&created.token, c.ip, at)
            .await
            .unwrap();
        assert_eq!(s.expires_at, original_expiry);
        assert_eq!(s.last_used_at, at);

        // 5h in: 3h remain. Renewed to a full TTL from now.
        let at = t0 + TimeDelta::hours(5);
        let s = store
            .validate_session_at(&created.token, c.ip, at)
            .await
            .unwrap();
        assert_eq!(s.expires_at, at + TimeDelta::hours(8));

        // Renewal was persisted: still valid past the original expiry.
        let later = original_expiry + TimeDelta::hours(1);
        assert!(
            store
                .validate_session_at(&created.token, c.ip, later)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let store = memory_store(policy(false)).await;
        let c = client("10.0.0.1");
        let t0 = now_millis();
        let created = store
            .create_session_at(PrincipalId::ADMIN, &c, t0)
            .await
            .unwrap();
        let after = t0 + TimeDelta::hours(9);
        assert!(matches!(
            store.validate_session_at(&created.token, c.ip, after).await,
            Err(AuthError::InvalidCredential)
        ));
        assert_eq!(store.cleanup_expired_sessions_at(after).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn strict_ip_revokes_on_mismatch() {
        let store = memory_store(policy(true)).await;
        let created = store
            .create_session(PrincipalId::ADMIN, &client("10.0.0.1"))
            .await
            .unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(matches!(
            store.validate_session(&created.token, other).await,
            Err(AuthError::InvalidCredential)
        ));
        // Revoked, so the original address fails too.
        assert!(
            store
                .validate_session(&created.token, "10.0.0.1".parse().unwrap())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn lax_ip_allows_roaming() {
        let store = memory_store(policy(false)).await;
        let created = store
            .create_session(PrincipalId::ADMIN, &client("10.0.0.1"))
            .await
            .unwrap();
        assert!(
            store
                .validate_session(&created.token, "192.0.2.9".parse().unwrap())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = memory_store(policy(false)).await;
        let c = client("10.0.0.1");
        let created = store.create_session(PrincipalId::ADMIN, &c).await.unwrap();
        assert!(store.revoke_session(&created.token).await.unwrap());
        assert!(!store.revoke_session(&created.token).await.unwrap());
        assert!(!store.revoke_session("never-issued").await.unwrap());
        assert!(store.validate_session(&created.token, c.ip).await.is_err());
        assert_eq!(store.revoke_all_sessions(PrincipalId::ADMIN).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_renewal_keeps_session_valid() {
        let store = memory_store(policy(false)).await;
        let c = client("10.0.0.1");
        let t0 = now_millis();
        let created = store
            .create_session_at(PrincipalId::ADMIN, &c, t0)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER no_session_updates BEFORE UPDATE ON auth_sessions
             BEGIN SELECT RAISE(FAIL, 'read only'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let at = t0 + TimeDelta::hours(5);
        let s = store
            .validate_session_at(&created.token, c.ip, at)
            .await
            .unwrap();
        assert_eq!(s.id, created.session.id);
        // Nothing was written, so the stored expiry is what callers see.
        assert_eq!(s.expires_at, created.session.expires_at);
    }
}
