//! Periodic cleanup of expired auth state.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    credential_store::CredentialStore,
    login_defense::LoginDefenseMonitor,
    passkey::{CeremonyVerifier, PasskeyCoordinator},
};

/// Something holding state that expires.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove expired entries and return how many went.
    async fn sweep(&self) -> anyhow::Result<u64>;
}

#[async_trait]
impl Sweep for CredentialStore {
    fn name(&self) -> &'static str {
        "sessions"
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        Ok(self.cleanup_expired_sessions().await?)
    }
}

#[async_trait]
impl Sweep for LoginDefenseMonitor {
    fn name(&self) -> &'static str {
        "login_attempts"
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        Ok(self.prune().await?)
    }
}

#[async_trait]
impl<V: CeremonyVerifier> Sweep for PasskeyCoordinator<V> {
    fn name(&self) -> &'static str {
        "passkey_ceremonies"
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        Ok(PasskeyCoordinator::sweep(self) as u64)
    }
}

/// Run every target once per `interval` until `cancel` fires. The first pass
/// runs immediately. A failing target is logged and retried next tick.
pub fn spawn_sweeper(
    targets: Vec<Arc<dyn Sweep>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("auth sweeper stopped");
                    break;
                },
                _ = ticker.tick() => run_once(&targets).await,
            }
        }
    })
}

pub async fn run_once(targets: &[Arc<dyn Sweep>]) {
    for target in targets {
        match target.sweep().await {
            Ok(0) => {},
            Ok(removed) => debug!(target = target.name(), removed, "swept expired entries"),
            Err(e) => warn!(target = target.name(), error = %e, "sweep failed"),
        }
    }
}
