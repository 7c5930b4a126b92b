use {
    anyhow::Result,
    anzuimg_auth::{CredentialStore, PrincipalId, SessionPolicy, TokenActivity, TokenType},
    anzuimg_config::AnzuConfig,
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum TokenAction {
    /// Create an API token. The raw token is printed once.
    Create {
        /// Label for the token (e.g. "CI pipeline").
        #[arg(long)]
        name: String,
        /// full, upload_list or list_only. Defaults to full.
        #[arg(long, default_value = "full")]
        r#type: String,
        /// Comma-separated IPs or CIDR ranges allowed to use the token.
        #[arg(long)]
        allow: Option<String>,
    },
    /// List API tokens.
    List,
    /// Delete an API token by id.
    Revoke { id: i64 },
}

pub async fn handle_tokens(config: &AnzuConfig, action: TokenAction) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        TokenAction::Create {
            name,
            r#type,
            allow,
        } => create(&store, &name, &r#type, allow.as_deref()).await,
        TokenAction::List => list(&store).await,
        TokenAction::Revoke { id } => revoke(&store, id).await,
    }
}

pub(crate) async fn open_store(config: &AnzuConfig) -> Result<CredentialStore> {
    let pool = sqlx::SqlitePool::connect(&config.database.url).await?;
    CredentialStore::new(pool, SessionPolicy::from_config(&config.auth)).await
}

/// Split a comma-separated list, dropping blanks.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

async fn create(
    store: &CredentialStore,
    name: &str,
    token_type: &str,
    allow: Option<&str>,
) -> Result<()> {
    let token_type = TokenType::from_name(token_type)?;
    let allowlist = parse_list(allow);
    let created = store
        .create_token(PrincipalId::ADMIN, name, token_type, &allowlist)
        .await?;
    store
        .record_token_activity(&TokenActivity {
            method: "CLI".into(),
            ..TokenActivity::new(&created.token, "token_create")
        })
        .await;

    let token = &created.token;
    println!("API token created.");
    println!();
    println!("  ID:     {}", token.id);
    println!("  Name:   {}", token.name);
    println!("  Type:   {}", token.token_type.as_str());
    let scopes: Vec<&str> = token.scopes().iter().map(|s| s.as_str()).collect();
    println!("  Scopes: {}", scopes.join(", "));
    if !token.ip_allowlist.is_empty() {
        println!("  Allow:  {}", token.ip_allowlist.join(", "));
    }
    println!();
    println!("Token (save this now, it won't be shown again):");
    println!();
    println!("  {}", created.raw);
    println!();
    Ok(())
}

async fn list(store: &CredentialStore) -> Result<()> {
    let tokens = store.list_tokens().await?;
    if tokens.is_empty() {
        println!("No API tokens.");
        return Ok(());
    }
    for t in &tokens {
        let last_used = t
            .last_used_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!(
            "  {:>4}  {:<24} {:<12} {}…  last used {last_used}",
            t.id,
            t.name,
            t.token_type.as_str(),
            t.token_prefix
        );
    }
    Ok(())
}

async fn revoke(store: &CredentialStore, id: i64) -> Result<()> {
    let token = store.get_token(id).await?;
    store.delete_token(id).await?;
    store
        .record_token_activity(&TokenActivity {
            method: "CLI".into(),
            ..TokenActivity::new(&token, "token_delete")
        })
        .await;
    println!("Deleted API token {id} ({}).", token.name);
    Ok(())
}
