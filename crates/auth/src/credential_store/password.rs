use std::sync::atomic::Ordering;

use {
    argon2::{
        Argon2,
        password_hash::{
            PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
        },
    },
    chrono::Utc,
    tracing::info,
};

use crate::{
    clock::to_millis,
    error::{AuthError, Denied, Result},
    principal::PrincipalId,
};

use super::CredentialStore;

const MIN_PASSWORD_LEN: usize = 8;

impl CredentialStore {
    // ── Setup ────────────────────────────────────────────────────────────

    /// Whether the administrative principal has a password yet.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub(super) async fn has_password(&self) -> anyhow::Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM auth_password WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Set the first password. Fails once a password exists, including when
    /// two setup requests race.
    pub async fn initialize(&self, password: &str) -> Result<()> {
        if self.is_initialized() {
            return Err(AuthError::Forbidden(Denied::AlreadyInitialized));
        }
        validate_password_strength(password)?;
        let hash = hash_password(password)?;
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            "INSERT INTO auth_password (id, password_hash, created_at, updated_at)
             VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.initialized.store(true, Ordering::Relaxed);
        if result.rows_affected() == 0 {
            return Err(AuthError::Forbidden(Denied::AlreadyInitialized));
        }
        info!("administrator password initialized");
        Ok(())
    }

    // ── Password ─────────────────────────────────────────────────────────

    /// Verify a password against the stored hash. `false` before setup.
    pub async fn verify_password(&self, password: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password_hash FROM auth_password WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let Some((hash,)) = row else {
            return Ok(false);
        };
        Ok(verify_hash(password, &hash))
    }

    /// Replace the password and revoke every session of the principal in one
    /// transaction. Returns the number of sessions revoked.
    pub async fn change_password(&self, current: &str, new_password: &str) -> Result<u64> {
        if !self.verify_password(current).await? {
            return Err(AuthError::InvalidCredential);
        }
        validate_password_strength(new_password)?;
        let hash = hash_password(new_password)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE auth_password SET password_hash = ?, updated_at = ? WHERE id = 1")
            .bind(&hash)
            .bind(to_millis(Utc::now()))
            .execute(&mut *tx)
            .await?;
        let revoked = sqlx::query("DELETE FROM auth_sessions WHERE principal_id = ?")
            .bind(PrincipalId::ADMIN.as_i64())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(revoked, "administrator password changed");
        Ok(revoked)
    }
}

/// At least eight characters with an uppercase letter, a lowercase letter
/// and a digit.
pub fn validate_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::invalid(
            "password must be at least 8 characters long",
        ));
    }
    let upper = password.chars().any(|c| c.is_ascii_uppercase());
    let lower = password.chars().any(|c| c.is_ascii_lowercase());
    let digit = password.chars().any(|c| c.is_ascii_digit());
    if !(upper && lower && digit) {
        return Err(AuthError::invalid(
            "password must contain uppercase letters, lowercase letters and digits",
        ));
    }
    Ok(())
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

fn verify_hash(password: &str, hash_str: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash_str) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            credential_store::{SessionPolicy, tests::memory_store},
            principal::ClientContext,
        },
        rstest::rstest,
    };

    #[test]
    fn hash_roundtrip() {
        let hash = hash_password("Test1234").unwrap();
        assert!(verify_hash("Test1234", &hash));
        assert!(!verify_hash("wrong", &hash));
        assert!(!verify_hash("Test1234", "not-a-phc-string"));
    }

    #[rstest]
    #[case("Abcdef12", true)]
    #[case("Abc12", false)]
    #[case("abcdefg1", false)]
    #[case("ABCDEFG1", false)]
    #[case("Abcdefgh", false)]
    fn password_policy(#[case] password: &str, #[case] ok: bool) {
        assert_eq!(validate_password_strength(password).is_ok(), ok);
    }

    #[tokio::test]
    async fn initialize_once() {
        let store = memory_store(SessionPolicy::default()).await;
        assert!(!store.is_initialized());
        assert!(!store.verify_password("Secret123").await.unwrap());

        assert!(matches!(
            store.initialize("weak").await,
            Err(AuthError::Invalid(_))
        ));
        assert!(!store.is_initialized());

        store.initialize("Secret123").await.unwrap();
        assert!(store.is_initialized());
        assert!(store.verify_password("Secret123").await.unwrap());
        assert!(!store.verify_password("Secret124").await.unwrap());

        assert!(matches!(
            store.initialize("Another123").await,
            Err(AuthError::Forbidden(Denied::AlreadyInitialized))
        ));
    }

    #[tokio::test]
    async fn change_password_revokes_sessions() {
        let store = memory_store(SessionPolicy::default()).await;
        store.initialize("Secret123").await.unwrap();
        let client = ClientContext::new("127.0.0.1".parse().unwrap(), "test");
        let created = store
            .create_session(PrincipalId::ADMIN, &client)
            .await
            .unwrap();

        assert!(matches!(
            store.change_password("Wrong1234", "Newpass123").await,
            Err(AuthError::InvalidCredential)
        ));

        let revoked = store
            .change_password("Secret123", "Newpass123")
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(store.verify_password("Newpass123").await.unwrap());
        assert!(!store.verify_password("Secret123").await.unwrap());
        assert!(matches!(
            store.validate_session(&created.token, client.ip).await,
            Err(AuthError::InvalidCredential)
        ));
    }
}
