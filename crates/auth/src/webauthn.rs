//! [`CeremonyVerifier`] backed by `webauthn-rs`.

use {
    anzuimg_config::PasskeyConfig,
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    tracing::warn,
    webauthn_rs::prelude::*,
};

use crate::{
    credential_store::{NewPasskey, PasskeyCredential},
    error::{AuthError, Resource, Result},
    passkey::{CeremonyVerifier, PasskeyCoordinator, VerifiedAssertion},
    principal::{ADMIN_DISPLAY_NAME, ADMIN_USERNAME, PrincipalId},
};

pub type WebauthnCoordinator = PasskeyCoordinator<WebauthnVerifier>;

pub struct WebauthnVerifier {
    webauthn: Webauthn,
}

/// Login ceremony state. The candidate passkeys are kept so the matching one
/// can be updated after a successful assertion.
pub struct PendingLogin {
    state: PasskeyAuthentication,
    passkeys: Vec<Passkey>,
}

impl WebauthnVerifier {
    /// `rp_id` is the hostname (e.g. "localhost" or "img.example.com");
    /// `rp_origin` the full origin URL the browser sees.
    pub fn new(rp_id: &str, rp_origin: &str, rp_name: &str) -> anyhow::Result<Self> {
        let origin = Url::parse(rp_origin)
            .map_err(|e| anyhow::anyhow!("invalid passkey origin {rp_origin}: {e}"))?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)
            .map_err(|e| anyhow::anyhow!("webauthn builder error: {e}"))?
            .rp_name(rp_name)
            .build()
            .map_err(|e| anyhow::anyhow!("webauthn build error: {e}"))?;
        Ok(Self { webauthn })
    }

    pub fn from_config(config: &PasskeyConfig) -> anyhow::Result<Self> {
        Self::new(&config.rp_id, &config.rp_origin, &config.rp_display_name)
    }
}

/// Stable WebAuthn user handle for a principal.
fn user_handle(principal: PrincipalId) -> Uuid {
    Uuid::from_u64_pair(0, principal.as_i64().unsigned_abs())
}

fn encode_credential_id(passkey: &Passkey) -> String {
    URL_SAFE_NO_PAD.encode(passkey.cred_id().as_slice())
}

/// A stored credential that no longer deserializes is a store failure.
fn decode_passkeys(credentials: &[PasskeyCredential]) -> Result<Vec<Passkey>> {
    credentials
        .iter()
        .map(|c| {
            serde_json::from_slice::<Passkey>(&c.material).map_err(|e| {
                AuthError::Internal(anyhow::anyhow!(
                    "passkey {} has unreadable material: {e}",
                    c.id
                ))
            })
        })
        .collect()
}

fn serialize(passkey: &Passkey) -> Result<Vec<u8>> {
    serde_json::to_vec(passkey).map_err(|e| AuthError::Internal(e.into()))
}

impl CeremonyVerifier for WebauthnVerifier {
    type LoginOptions = RequestChallengeResponse;
    type LoginResponse = PublicKeyCredential;
    type LoginState = PendingLogin;
    type RegistrationOptions = CreationChallengeResponse;
    type RegistrationResponse = RegisterPublicKeyCredential;
    type RegistrationState = PasskeyRegistration;

    fn begin_registration(
        &self,
        principal: PrincipalId,
        existing: &[PasskeyCredential],
    ) -> Result<(CreationChallengeResponse, PasskeyRegistration)> {
        let exclude: Vec<CredentialID> = decode_passkeys(existing)?
            .iter()
            .map(|pk| pk.cred_id().clone())
            .collect();
        let exclude_opt = if exclude.is_empty() {
            None
        } else {
            Some(exclude)
        };

        self.webauthn
            .start_passkey_registration(
                user_handle(principal),
                ADMIN_USERNAME,
                ADMIN_DISPLAY_NAME,
                exclude_opt,
            )
            .map_err(|e| anyhow::anyhow!("start_passkey_registration: {e}").into())
    }

    fn finish_registration(
        &self,
        state: PasskeyRegistration,
        response: &RegisterPublicKeyCredential,
    ) -> Result<NewPasskey> {
        let passkey = self
            .webauthn
            .finish_passkey_registration(response, &state)
            .map_err(|e| {
                warn!(error = %e, "passkey registration rejected");
                AuthError::InvalidCredential
            })?;
        Ok(NewPasskey {
            credential_id: encode_credential_id(&passkey),
            material: serialize(&passkey)?,
            attestation_type: "none".into(),
            // Initial sign count for a new credential.
            sign_count: 0,
        })
    }

    fn begin_login(
        &self,
        credentials: &[PasskeyCredential],
    ) -> Result<(RequestChallengeResponse, PendingLogin)> {
        let passkeys = decode_passkeys(credentials)?;
        if passkeys.is_empty() {
            return Err(AuthError::NotFound(Resource::Passkey));
        }
        let (options, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| anyhow::anyhow!("start_passkey_authentication: {e}"))?;
        Ok((options, PendingLogin { state, passkeys }))
    }

    fn finish_login(
        &self,
        pending: PendingLogin,
        response: &PublicKeyCredential,
    ) -> Result<VerifiedAssertion> {
        let result = self
            .webauthn
            .finish_passkey_authentication(response, &pending.state)
            .map_err(|e| {
                warn!(error = %e, "passkey assertion rejected");
                AuthError::InvalidCredential
            })?;

        let mut material = None;
        if result.needs_update() {
            let mut passkeys = pending.passkeys;
            if let Some(pk) = passkeys
                .iter_mut()
                .find(|pk| pk.cred_id() == result.cred_id())
            {
                pk.update_credential(&result);
                material = Some(serialize(pk)?);
            }
        }

        Ok(VerifiedAssertion {
            credential_id: URL_SAFE_NO_PAD.encode(result.cred_id().as_slice()),
            sign_count: result.counter(),
            material,
        })
    }
}
