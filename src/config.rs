//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNNELGATE_API_KEY`, `TUNNELGATE_LISTEN`,
//!    `TUNNELGATE_CORS_ORIGINS` (comma-separated)
//! 2. **Config file** — path via `--config <path>`, or `tunnelgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:6080"
//! upgrade_path = "websockify"
//! cookie = "websockify"        # "" disables Set-Cookie
//! relay_buffer_size = 65536
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [tokens]
//! default_expiration_secs = 3600
//! sweep_interval_secs = 5
//! remote_timeout_secs = 30
//! probe_timeout_ms = 1000
//!
//! # Omit allowed_origins for a wildcard Access-Control-Allow-Origin
//! [cors]
//! allowed_origins = ["https://console.example.com"]
//! allow_credentials = true
//!
//! [backend]
//! open_command = ["salt", "{target}", "remote_control.create_ssh_connection", "{port}", "--out=json"]
//! close_command = ["salt", "{target}", "remote_control.close_ssh_connection", "{handle}", "--out=json"]
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tunnelgate.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:6080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path prefix of the upgrade endpoint, without slashes (default `websockify`).
    #[serde(default = "default_upgrade_path")]
    pub upgrade_path: String,
    /// Session cookie name set on upgrade; empty disables it.
    #[serde(default = "default_cookie")]
    pub cookie: String,
    /// Backend read size per readiness event (default 64 KiB).
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer key for the lifecycle endpoints. Override with
    /// `TUNNELGATE_API_KEY`. Defaults to `"change-me"`, which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Token lifetime and remote-call bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    /// Idle window before a tunnel is reclaimed (default 3600).
    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: u64,
    /// Seconds between expiry sweeps (default 5).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Bound on each open/close command (default 30).
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    /// Bound on the liveness probe connect (default 1000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Origins echoed back in `Access-Control-Allow-Origin`. Unset means `*`.
    #[serde(default)]
    pub allowed_origins: Option<Vec<String>>,
    #[serde(default = "default_allow_credentials")]
    pub allow_credentials: bool,
}

/// Argv templates for starting and stopping remote tunnels.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Placeholders: `{target}`, `{port}`.
    #[serde(default = "default_open_command")]
    pub open_command: Vec<String>,
    /// Placeholders: `{target}`, `{handle}`.
    #[serde(default = "default_close_command")]
    pub close_command: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:6080".to_string()
}
fn default_upgrade_path() -> String {
    "websockify".to_string()
}
fn default_cookie() -> String {
    "websockify".to_string()
}
fn default_relay_buffer_size() -> usize {
    65536
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_expiration_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_remote_timeout_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_allow_credentials() -> bool {
    true
}
fn default_open_command() -> Vec<String> {
    [
        "salt",
        "{target}",
        "remote_control.create_ssh_connection",
        "{port}",
        "--out=json",
    ]
    .map(String::from)
    .to_vec()
}
fn default_close_command() -> Vec<String> {
    [
        "salt",
        "{target}",
        "remote_control.close_ssh_connection",
        "{handle}",
        "--out=json",
    ]
    .map(String::from)
    .to_vec()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upgrade_path: default_upgrade_path(),
            cookie: default_cookie(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            default_expiration_secs: default_expiration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            remote_timeout_secs: default_remote_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            allow_credentials: default_allow_credentials(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            open_command: default_open_command(),
            close_command: default_close_command(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `tunnelgate.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Env var overrides, read through `var` so tests need not touch the
    /// process environment.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("TUNNELGATE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = var("TUNNELGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(origins) = var("TUNNELGATE_CORS_ORIGINS") {
            self.cors.allowed_origins = Some(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
    }

    /// Upgrade path prefix normalized to `/<path>` (no trailing slash).
    pub fn upgrade_route(&self) -> String {
        format!("/{}", self.server.upgrade_path.trim_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.server.listen, "0.0.0.0:6080");
        assert_eq!(c.server.cookie, "websockify");
        assert_eq!(c.server.relay_buffer_size, 65536);
        assert_eq!(c.tokens.sweep_interval_secs, 5);
        assert!(c.cors.allowed_origins.is_none());
        assert!(c.cors.allow_credentials);
        assert_eq!(c.backend.open_command[0], "salt");
        assert_eq!(c.upgrade_route(), "/websockify");
    }

    #[test]
    fn test_partial_toml() {
        let c: Config = toml::from_str(
            r#"
            [server]
            upgrade_path = "/vnc/"
            cookie = ""

            [cors]
            allowed_origins = ["https://a.test"]
            allow_credentials = false

            [tokens]
            default_expiration_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.upgrade_route(), "/vnc");
        assert!(c.server.cookie.is_empty());
        assert_eq!(c.server.listen, "0.0.0.0:6080");
        assert_eq!(c.cors.allowed_origins, Some(vec!["https://a.test".to_string()]));
        assert!(!c.cors.allow_credentials);
        assert_eq!(c.tokens.default_expiration_secs, 5);
        assert_eq!(c.tokens.remote_timeout_secs, 30);
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(|name| match name {
            "TUNNELGATE_API_KEY" => Some("s3cret".into()),
            "TUNNELGATE_CORS_ORIGINS" => Some("https://a.test, https://b.test,".into()),
            _ => None,
        });
        assert_eq!(c.auth.api_key, "s3cret");
        assert_eq!(c.server.listen, "0.0.0.0:6080");
        assert_eq!(
            c.cors.allowed_origins,
            Some(vec!["https://a.test".to_string(), "https://b.test".to_string()])
        );
    }

    #[test]
    fn test_missing_file_is_read_error() {
        assert!(matches!(
            Config::load(Some("/nonexistent/tunnelgate.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let path = std::env::temp_dir().join(format!("tunnelgate-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server\nlisten = 1").unwrap();
        let result = Config::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
