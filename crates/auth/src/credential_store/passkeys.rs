use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tracing::debug,
};

use crate::{
    clock::{from_millis, to_millis},
    error::{AuthError, Resource, Result},
    principal::{ClientContext, PrincipalId},
};

use super::CredentialStore;

/// A registered WebAuthn credential.
///
/// `material` is the serialized credential the verifier needs to check an
/// assertion (public key, counter, flags). It never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct PasskeyCredential {
    pub id: i64,
    pub principal: PrincipalId,
    /// Base64url credential id, as sent by authenticators.
    pub credential_id: String,
    #[serde(skip)]
    pub material: Vec<u8>,
    pub attestation_type: String,
    pub sign_count: u32,
    pub device_name: String,
    pub user_agent: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// What a successful registration ceremony produces.
#[derive(Debug, Clone)]
pub struct NewPasskey {
    pub credential_id: String,
    pub material: Vec<u8>,
    pub attestation_type: String,
    pub sign_count: u32,
}

type PasskeyRow = (
    i64,
    i64,
    String,
    Vec<u8>,
    String,
    i64,
    String,
    String,
    String,
    i64,
    Option<i64>,
);

fn passkey_from_row(row: PasskeyRow) -> PasskeyCredential {
    let (
        id,
        principal_id,
        credential_id,
        material,
        attestation_type,
        sign_count,
        device_name,
        user_agent,
        ip_address,
        created_at,
        last_used_at,
    ) = row;
    PasskeyCredential {
        id,
        principal: PrincipalId::from_row(principal_id),
        credential_id,
        material,
        attestation_type,
        sign_count: u32::try_from(sign_count).unwrap_or(u32::MAX),
        device_name,
        user_agent,
        ip_address,
        created_at: from_millis(created_at),
        last_used_at: last_used_at.map(from_millis),
    }
}

const PASSKEY_COLUMNS: &str = "id, principal_id, credential_id, passkey_data, attestation_type, \
                               sign_count, device_name, user_agent, ip_address, created_at, \
                               last_used_at";

impl CredentialStore {
    // ── Passkeys ─────────────────────────────────────────────────────────

    pub async fn store_passkey(
        &self,
        principal: PrincipalId,
        passkey: NewPasskey,
        client: &ClientContext,
        device_name: &str,
    ) -> Result<PasskeyCredential> {
        let now = Utc::now();
        let ip_address = client.ip.to_canonical().to_string();
        let result = sqlx::query(
            "INSERT INTO passkeys
                (principal_id, credential_id, passkey_data, attestation_type, sign_count,
                 device_name, user_agent, ip_address, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(principal.as_i64())
        .bind(&passkey.credential_id)
        .bind(&passkey.material)
        .bind(&passkey.attestation_type)
        .bind(i64::from(passkey.sign_count))
        .bind(device_name)
        .bind(&client.user_agent)
        .bind(&ip_address)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AuthError::invalid("passkey is already registered"));
            },
            Err(e) => return Err(e.into()),
        };

        debug!(passkey_id = id, device = device_name, "passkey stored");
        Ok(PasskeyCredential {
            id,
            principal,
            credential_id: passkey.credential_id,
            material: passkey.material,
            attestation_type: passkey.attestation_type,
            sign_count: passkey.sign_count,
            device_name: device_name.to_string(),
            user_agent: client.user_agent.clone(),
            ip_address,
            created_at: now,
            last_used_at: None,
        })
    }

    /// Credentials of one principal, newest first.
    pub async fn list_passkeys(&self, principal: PrincipalId) -> Result<Vec<PasskeyCredential>> {
        let rows: Vec<PasskeyRow> = sqlx::query_as(&format!(
            "SELECT {PASSKEY_COLUMNS} FROM passkeys WHERE principal_id = ?
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(principal.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(passkey_from_row).collect())
    }

    /// Every registered credential, for discoverable login.
    pub async fn all_passkeys(&self) -> Result<Vec<PasskeyCredential>> {
        let rows: Vec<PasskeyRow> =
            sqlx::query_as(&format!("SELECT {PASSKEY_COLUMNS} FROM passkeys ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(passkey_from_row).collect())
    }

    pub async fn delete_passkey(&self, credential_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM passkeys WHERE credential_id = ?")
            .bind(credential_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(Resource::Passkey));
        }
        Ok(())
    }

    pub async fn count_passkeys(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM passkeys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn has_passkeys(&self) -> Result<bool> {
        Ok(self.count_passkeys().await? > 0)
    }

    /// Persist the outcome of a verified assertion. The stored counter never
    /// decreases. Returns the owning principal.
    pub async fn record_passkey_use(
        &self,
        credential_id: &str,
        sign_count: u32,
        material: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<PrincipalId> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE passkeys
             SET sign_count = MAX(sign_count, ?),
                 passkey_data = COALESCE(?, passkey_data),
                 last_used_at = ?
             WHERE credential_id = ?
             RETURNING principal_id",
        )
        .bind(i64::from(sign_count))
        .bind(material)
        .bind(to_millis(now))
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id,)| PrincipalId::from_row(id))
            .ok_or(AuthError::NotFound(Resource::Passkey))
    }
}
