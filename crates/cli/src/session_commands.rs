use {anyhow::Result, anzuimg_auth::PrincipalId, anzuimg_config::AnzuConfig, clap::Subcommand};

use crate::token_commands::open_store;

#[derive(Subcommand)]
pub enum SessionAction {
    /// Sign out every browser session (e.g. after a lost device).
    RevokeAll,
    /// Delete sessions that have already expired.
    Cleanup,
}

pub async fn handle_sessions(config: &AnzuConfig, action: SessionAction) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        SessionAction::RevokeAll => {
            let n = store.revoke_all_sessions(PrincipalId::ADMIN).await?;
            println!("Revoked {n} session(s).");
        },
        SessionAction::Cleanup => {
            let n = store.cleanup_expired_sessions().await?;
            println!("Removed {n} expired session(s).");
        },
    }
    Ok(())
}
