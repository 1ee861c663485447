//! Flowpost configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FlowpostError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowpostConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_database_path() -> String {
    "~/.flowpost/flowpost.db".into()
}

impl Default for FlowpostConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            gateway: GatewayConfig::default(),
            engine: EngineConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl FlowpostConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowpostError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FlowpostError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowpostError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Flowpost home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowpost")
    }

    /// Database path with `~` expanded.
    pub fn resolved_database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Apply `FLOWPOST_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (env, test maps).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(secret) = get("FLOWPOST_CRON_SECRET") {
            self.gateway.cron_secret = Some(secret);
        }
        if let Some(path) = get("FLOWPOST_DATABASE") {
            self.database_path = path;
        }
        if let Some(pass) = get("FLOWPOST_SMTP_PASSWORD") {
            self.delivery.smtp.password = pass;
        }
        if let Some(key) = get("FLOWPOST_HTTP_API_KEY") {
            self.delivery.http.api_key = key;
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared operational secret for cron callers. Unset disables secret auth.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3579
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cron_secret: None,
        }
    }
}

impl GatewayConfig {
    /// The configured secret, if non-empty.
    pub fn secret(&self) -> Option<&str> {
        self.cron_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Engine batch limits and loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_runs")]
    pub max_runs_per_tick: usize,
    #[serde(default = "default_max_flows")]
    pub max_flows_per_pass: usize,
    #[serde(default = "default_max_hops")]
    pub max_hops_per_step: usize,
    #[serde(default = "default_worker_limit")]
    pub worker_batch_limit: usize,
}

fn default_tick_interval() -> u64 {
    60
}
fn default_max_runs() -> usize {
    200
}
fn default_max_flows() -> usize {
    50
}
fn default_max_hops() -> usize {
    32
}
fn default_worker_limit() -> usize {
    25
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_runs_per_tick: default_max_runs(),
            max_flows_per_pass: default_max_flows(),
            max_hops_per_step: default_max_hops(),
            worker_batch_limit: default_worker_limit(),
        }
    }
}

/// Which message gateway to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Smtp,
    Http,
    #[default]
    Log,
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub http: HttpDeliveryConfig,
}

/// SMTP relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Provider HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpDeliveryConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for HttpDeliveryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: default_http_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FlowpostConfig::default();
        assert_eq!(config.gateway.port, 3579);
        assert_eq!(config.engine.max_runs_per_tick, 200);
        assert_eq!(config.engine.max_flows_per_pass, 50);
        assert_eq!(config.delivery.mode, DeliveryMode::Log);
        assert!(config.gateway.secret().is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/tmp/fp.db"

            [gateway]
            port = 8080
            cron_secret = "s3cret"

            [engine]
            max_runs_per_tick = 10

            [delivery]
            mode = "smtp"

            [delivery.smtp]
            host = "smtp.example.com"
            username = "bot@example.com"
        "#;

        let config: FlowpostConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, "/tmp/fp.db");
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.secret(), Some("s3cret"));
        assert_eq!(config.engine.max_runs_per_tick, 10);
        assert_eq!(config.engine.max_hops_per_step, 32);
        assert_eq!(config.delivery.mode, DeliveryMode::Smtp);
        assert_eq!(config.delivery.smtp.port, 587);
    }

    #[test]
    fn test_blank_secret_is_unset() {
        let gw = GatewayConfig {
            cron_secret: Some("   ".into()),
            ..Default::default()
        };
        assert!(gw.secret().is_none());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FLOWPOST_CRON_SECRET", "from-env"),
            ("FLOWPOST_SMTP_PASSWORD", "pw"),
            ("FLOWPOST_HTTP_API_KEY", ""),
        ]);
        let mut config = FlowpostConfig::default();
        config.delivery.http.api_key = "keep".into();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.secret(), Some("from-env"));
        assert_eq!(config.delivery.smtp.password, "pw");
        assert_eq!(config.delivery.http.api_key, "keep");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("flowpost-config-test");
        let path = dir.join("config.toml");
        let mut config = FlowpostConfig::default();
        config.engine.tick_interval_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = FlowpostConfig::load_from(&path).unwrap();
        assert_eq!(loaded.engine.tick_interval_secs, 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_tilde_expansion() {
        let config = FlowpostConfig {
            database_path: "/abs/path.db".into(),
            ..Default::default()
        };
        assert_eq!(config.resolved_database_path(), PathBuf::from("/abs/path.db"));
    }

    #[test]
    fn test_sample_config_parses() {
        let config: FlowpostConfig =
            toml::from_str(include_str!("../../../demos/config.toml")).unwrap();
        assert_eq!(config.gateway.port, 3579);
        assert_eq!(config.delivery.mode, DeliveryMode::Log);
        assert!(config.gateway.secret().is_none());
        assert_eq!(config.delivery.smtp.host, "smtp.example.com");
    }
}
