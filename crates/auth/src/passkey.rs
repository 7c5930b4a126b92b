//! Passkey ceremony orchestration.
//!
//! The coordinator owns ceremony state and persistence. Signature and
//! attestation checks live behind [`CeremonyVerifier`], so the flow can be
//! tested without real authenticators.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    serde::{Serialize, de::DeserializeOwned},
    tracing::{debug, info},
};

use crate::{
    challenge::ChallengeStore,
    credential_store::{CredentialStore, NewPasskey, NewSession, PasskeyCredential},
    device::device_name,
    error::{AuthError, Resource, Result},
    principal::{ClientContext, PrincipalId},
};

/// Outcome of a verified login assertion.
#[derive(Debug, Clone)]
pub struct VerifiedAssertion {
    pub credential_id: String,
    pub sign_count: u32,
    /// Replacement credential material when the verifier reports a change
    /// (counter or backup state).
    pub material: Option<Vec<u8>>,
}

/// WebAuthn cryptography. Implementations return
/// [`AuthError::InvalidCredential`] when a client response fails
/// verification.
pub trait CeremonyVerifier: Send + Sync + 'static {
    type RegistrationOptions: Serialize + Send;
    type RegistrationState: Send + Sync + 'static;
    type RegistrationResponse: DeserializeOwned + Send + Sync;
    type LoginOptions: Serialize + Send;
    type LoginState: Send + Sync + 'static;
    type LoginResponse: DeserializeOwned + Send + Sync;

    /// `existing` is used as the exclusion list.
    fn begin_registration(
        &self,
        principal: PrincipalId,
        existing: &[PasskeyCredential],
    ) -> Result<(Self::RegistrationOptions, Self::RegistrationState)>;

    fn finish_registration(
        &self,
        state: Self::RegistrationState,
        response: &Self::RegistrationResponse,
    ) -> Result<NewPasskey>;

    fn begin_login(
        &self,
        credentials: &[PasskeyCredential],
    ) -> Result<(Self::LoginOptions, Self::LoginState)>;

    fn finish_login(
        &self,
        state: Self::LoginState,
        response: &Self::LoginResponse,
    ) -> Result<VerifiedAssertion>;
}

/// Options for the client plus the correlation id that must accompany the
/// finish call.
#[derive(Debug, Serialize)]
pub struct Ceremony<O> {
    pub session_id: String,
    pub options: O,
}

struct PendingRegistration<S> {
    principal: PrincipalId,
    state: S,
}

pub struct PasskeyCoordinator<V: CeremonyVerifier> {
    verifier: V,
    store: Arc<CredentialStore>,
    registrations: ChallengeStore<PendingRegistration<V::RegistrationState>>,
    logins: ChallengeStore<V::LoginState>,
}

impl<V: CeremonyVerifier> PasskeyCoordinator<V> {
    pub fn new(verifier: V, store: Arc<CredentialStore>, ceremony_ttl: Duration) -> Self {
        Self {
            verifier,
            store,
            registrations: ChallengeStore::new(ceremony_ttl),
            logins: ChallengeStore::new(ceremony_ttl),
        }
    }

    // ── Registration ─────────────────────────────────────────────────────

    pub async fn begin_registration(
        &self,
        principal: PrincipalId,
    ) -> Result<Ceremony<V::RegistrationOptions>> {
        let existing = self.store.list_passkeys(principal).await?;
        let (options, state) = self.verifier.begin_registration(principal, &existing)?;
        let session_id = self
            .registrations
            .insert(PendingRegistration { principal, state });
        debug!(excluded = existing.len(), "passkey registration started");
        Ok(Ceremony {
            session_id,
            options,
        })
    }

    /// Verify the authenticator's response and persist the credential.
    pub async fn finish_registration(
        &self,
        session_id: &str,
        response: &V::RegistrationResponse,
        client: &ClientContext,
    ) -> Result<PasskeyCredential> {
        let pending = self.registrations.take(session_id)?;
        let passkey = self
            .verifier
            .finish_registration(pending.state, response)?;
        let device = device_name(&client.user_agent);
        let stored = self
            .store
            .store_passkey(pending.principal, passkey, client, device)
            .await?;
        info!(passkey_id = stored.id, device, "passkey registered");
        Ok(stored)
    }

    // ── Login ────────────────────────────────────────────────────────────

    pub async fn begin_login(&self) -> Result<Ceremony<V::LoginOptions>> {
        let credentials = self.store.all_passkeys().await?;
        if credentials.is_empty() {
            return Err(AuthError::NotFound(Resource::Passkey));
        }
        let (options, state) = self.verifier.begin_login(&credentials)?;
        let session_id = self.logins.insert(state);
        Ok(Ceremony {
            session_id,
            options,
        })
    }

    /// Verify an assertion, persist the new counter and mint a session for
    /// the credential's owner.
    pub async fn finish_login(
        &self,
        session_id: &str,
        response: &V::LoginResponse,
        client: &ClientContext,
    ) -> Result<NewSession> {
        let state = self.logins.take(session_id)?;
        let assertion = self.verifier.finish_login(state, response)?;
        let principal = self
            .store
            .record_passkey_use(
                &assertion.credential_id,
                assertion.sign_count,
                assertion.material.as_deref(),
                Utc::now(),
            )
            .await
            .map_err(|e| match e {
                // Deleted between begin and finish.
                AuthError::NotFound(_) => AuthError::InvalidCredential,
                other => other,
            })?;
        self.store.create_session(principal, client).await
    }

    /// Drop expired ceremony state. Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        self.registrations.sweep() + self.logins.sweep()
    }
}
