use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::schema::{AnzuConfig, ClientIpStrategy, SameSitePolicy};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "anzuimg.toml",
    "anzuimg.yaml",
    "anzuimg.yml",
    "anzuimg.json",
];

/// Primary environment prefix. Every variable is also accepted with the
/// legacy `APP_` prefix.
const ENV_PREFIX: &str = "ANZUIMG_";
const LEGACY_ENV_PREFIX: &str = "APP_";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<AnzuConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply environment
/// overrides.
///
/// Search order:
/// 1. `./anzuimg.{toml,yaml,yml,json}`
/// 2. `~/.config/anzuimg/anzuimg.{toml,yaml,yml,json}`
///
/// Falls back to `AnzuConfig::default()` when nothing is found or the file
/// fails to parse.
pub fn discover_and_load() -> AnzuConfig {
    let config = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                AnzuConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        AnzuConfig::default()
    };
    apply_env_overrides(config)
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/anzuimg/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "anzuimg").map(|d| d.config_dir().to_path_buf())
}

/// Overlay `ANZUIMG_*` (or legacy `APP_*`) environment variables on `config`.
pub fn apply_env_overrides(config: AnzuConfig) -> AnzuConfig {
    apply_env_overrides_with(config, |name| std::env::var(name).ok())
}

/// Same as [`apply_env_overrides`] with a custom lookup, so tests do not
/// have to mutate the process environment.
fn apply_env_overrides_with(
    mut config: AnzuConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> AnzuConfig {
    let var = |key: &str| {
        lookup(&format!("{ENV_PREFIX}{key}"))
            .or_else(|| lookup(&format!("{LEGACY_ENV_PREFIX}{key}")))
            .filter(|v| !v.trim().is_empty())
    };

    if let Some(v) = var("BIND") {
        config.server.bind = v.trim().to_string();
    }
    if let Some(v) = var("PORT") {
        match v.trim().parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(value = %v, "ignoring invalid port override"),
        }
    }
    if let Some(v) = var("DATABASE_URL") {
        config.database.url = v;
    }
    if let Some(v) = var("TRUSTED_PROXIES") {
        config.client_ip.trusted_proxies = split_list(&v);
    }
    if let Some(v) = var("CLIENT_IP_HEADERS") {
        config.client_ip.headers = split_list(&v);
    }
    if let Some(v) = var("CLIENT_IP_XFF_STRATEGY") {
        config.client_ip.strategy = ClientIpStrategy::from_name(&v);
    }
    if let Some(v) = var("SETUP_TOKEN") {
        config.auth.setup_token = Some(Secret::new(v.trim().to_string()));
    }
    if let Some(v) = var("COOKIE_SAMESITE") {
        config.auth.cookie_same_site = SameSitePolicy::from_name(&v);
    }
    if let Some(v) = var("STRICT_SESSION_IP") {
        match parse_bool(&v) {
            Some(b) => config.auth.strict_session_ip = b,
            None => warn!(value = %v, "ignoring invalid STRICT_SESSION_IP override"),
        }
    }
    if let Some(v) = var("PASSKEY_RP_ID") {
        config.passkey.rp_id = v.trim().to_string();
    }
    if let Some(v) = var("PASSKEY_RP_ORIGIN") {
        config.passkey.rp_origin = v.trim().to_string();
    }
    if let Some(v) = var("PASSKEY_RP_DISPLAY_NAME") {
        config.passkey.rp_display_name = v.trim().to_string();
    }

    config
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<AnzuConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret, std::collections::HashMap};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn loads_toml_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("anzuimg.toml");
        std::fs::write(&toml_path, "[server]\nport = 9000\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().server.port, 9000);

        let yaml_path = dir.path().join("anzuimg.yaml");
        std::fs::write(&yaml_path, "auth:\n  strict_session_ip: true\n").unwrap();
        assert!(load_config(&yaml_path).unwrap().auth.strict_session_ip);

        let json_path = dir.path().join("anzuimg.json");
        std::fs::write(&json_path, r#"{"passkey":{"rp_id":"img.example.com"}}"#).unwrap();
        assert_eq!(
            load_config(&json_path).unwrap().passkey.rp_id,
            "img.example.com"
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anzuimg.ini");
        std::fs::write(&path, "").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn env_overrides_apply_with_legacy_alias() {
        let cfg = apply_env_overrides_with(
            AnzuConfig::default(),
            lookup(&[
                ("ANZUIMG_TRUSTED_PROXIES", "172.29.87.2/32, ,183.216.228.110"),
                ("APP_CLIENT_IP_XFF_STRATEGY", "rightmost"),
                ("APP_COOKIE_SAMESITE", "strict"),
                ("ANZUIMG_STRICT_SESSION_IP", "true"),
                ("ANZUIMG_SETUP_TOKEN", " bootstrap "),
                ("ANZUIMG_PORT", "9090"),
            ]),
        );
        assert_eq!(cfg.client_ip.trusted_proxies, vec![
            "172.29.87.2/32",
            "183.216.228.110"
        ]);
        assert_eq!(cfg.client_ip.strategy, ClientIpStrategy::RightmostPublic);
        assert_eq!(cfg.auth.cookie_same_site, SameSitePolicy::Strict);
        assert!(cfg.auth.strict_session_ip);
        assert_eq!(
            cfg.auth.setup_token.as_ref().unwrap().expose_secret(),
            "bootstrap"
        );
        assert_eq!(cfg.server.port, 9090);
    }

    #[test]
    fn primary_prefix_wins_over_legacy() {
        let cfg = apply_env_overrides_with(
            AnzuConfig::default(),
            lookup(&[
                ("ANZUIMG_PASSKEY_RP_ID", "primary.example"),
                ("APP_PASSKEY_RP_ID", "legacy.example"),
            ]),
        );
        assert_eq!(cfg.passkey.rp_id, "primary.example");
    }

    #[test]
    fn invalid_values_are_ignored() {
        let cfg = apply_env_overrides_with(
            AnzuConfig::default(),
            lookup(&[
                ("ANZUIMG_PORT", "not-a-port"),
                ("ANZUIMG_STRICT_SESSION_IP", "maybe"),
                ("ANZUIMG_SETUP_TOKEN", "   "),
            ]),
        );
        assert_eq!(cfg.server.port, 8080);
        assert!(!cfg.auth.strict_session_ip);
        assert!(cfg.auth.setup_token.is_none());
    }
}
