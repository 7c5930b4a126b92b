//! Configuration loading and environment overrides.
//!
//! Config files: `anzuimg.toml`, `anzuimg.yaml`, or `anzuimg.json`
//! Searched in `./` then `~/.config/anzuimg/`.
//!
//! `ANZUIMG_*` environment variables (legacy `APP_*` also accepted) override
//! file values.

pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config},
    schema::{
        AnzuConfig, AuthConfig, ClientIpConfig, ClientIpStrategy, DatabaseConfig, LockoutConfig,
        PasskeyConfig, SameSitePolicy, ServerConfig,
    },
};
