use std::{sync::Arc, time::Duration};

use {
    anzuimg_auth::{
        AuthorizationGate, ClientIpResolver, CredentialStore, LockoutPolicy, LoginDefenseMonitor,
        SecurityAuditLog, SecurityEvent, SessionPolicy, Sweep, WebauthnCoordinator,
        WebauthnVerifier,
    },
    anzuimg_config::{AnzuConfig, SameSitePolicy},
    secrecy::Secret,
    sqlx::SqlitePool,
    tracing::{info, warn},
};

use crate::{auth_middleware::Caller, error::ApiError};

/// Everything request handlers share. Built once at startup.
pub struct GatewayState {
    /// Server version string.
    pub version: String,
    pub store: Arc<CredentialStore>,
    pub gate: AuthorizationGate,
    pub login_defense: Arc<LoginDefenseMonitor>,
    pub audit: Arc<SecurityAuditLog>,
    /// Absent when the relying party could not be configured.
    pub passkeys: Option<Arc<WebauthnCoordinator>>,
    pub client_ip: ClientIpResolver,
    pub cookie_same_site: SameSitePolicy,
    pub setup_token: Option<Secret<String>>,
    pub sweep_interval: Duration,
}

impl GatewayState {
    /// Create the auth tables and wire every component from `config`.
    ///
    /// A bad trusted-proxy list is fatal. A bad relying-party configuration
    /// only disables passkeys.
    pub async fn from_config(config: &AnzuConfig, pool: SqlitePool) -> anyhow::Result<Arc<Self>> {
        let client_ip = ClientIpResolver::from_config(&config.client_ip)?;

        let store = Arc::new(
            CredentialStore::new(pool.clone(), SessionPolicy::from_config(&config.auth)).await?,
        );
        let audit = Arc::new(SecurityAuditLog::new(pool.clone()).await?);
        let login_defense = Arc::new(
            LoginDefenseMonitor::new(
                pool,
                Arc::clone(&audit),
                LockoutPolicy::from_config(&config.auth.lockout),
            )
            .await?,
        );

        let passkeys = match WebauthnVerifier::from_config(&config.passkey) {
            Ok(verifier) => Some(Arc::new(WebauthnCoordinator::new(
                verifier,
                Arc::clone(&store),
                Duration::from_secs(config.passkey.ceremony_ttl_secs),
            ))),
            Err(e) => {
                warn!(error = %e, "passkeys disabled");
                None
            },
        };
        info!(
            rp_id = %config.passkey.rp_id,
            passkeys = passkeys.is_some(),
            initialized = store.is_initialized(),
            "auth subsystem ready"
        );

        Ok(Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            gate: AuthorizationGate::new(Arc::clone(&store)),
            store,
            login_defense,
            audit,
            passkeys,
            client_ip,
            cookie_same_site: config.auth.cookie_same_site,
            setup_token: config.auth.setup_token.clone(),
            sweep_interval: Duration::from_secs(config.auth.sweep_interval_secs),
        }))
    }

    pub fn passkeys(&self) -> Result<&WebauthnCoordinator, ApiError> {
        self.passkeys
            .as_deref()
            .ok_or_else(ApiError::passkey_unavailable)
    }

    /// Append to the security log, stamped with the caller's address and
    /// route.
    pub async fn record_event(&self, caller: &Caller, event: SecurityEvent) {
        self.audit
            .record(&event.with_request(&caller.request_info()))
            .await;
    }

    /// Session lifetime, used as the cookie `Max-Age`.
    pub fn session_ttl(&self) -> Duration {
        self.store.session_policy().ttl
    }

    /// State the background sweeper keeps tidy.
    pub fn sweep_targets(&self) -> Vec<Arc<dyn Sweep>> {
        let mut targets: Vec<Arc<dyn Sweep>> = vec![
            Arc::clone(&self.store) as Arc<dyn Sweep>,
            Arc::clone(&self.login_defense) as Arc<dyn Sweep>,
        ];
        if let Some(passkeys) = &self.passkeys {
            targets.push(Arc::clone(passkeys) as Arc<dyn Sweep>);
        }
        targets
    }
}
