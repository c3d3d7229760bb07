use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub proxmox: Option<ProxmoxConfig>,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Connection settings for the monitored Proxmox node and container.
///
/// `host`, `token_id`, `node` and `container_id` may be left out while the
/// section is being filled in; see [`ProxmoxConfig::missing_fields`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxmoxConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxmox_port")]
    pub port: u16,
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_secret_env")]
    pub token_secret_env: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub container_id: Option<u32>,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_bot_keywords")]
    pub bot_keywords: Vec<String>,
    #[serde(default = "default_games_online")]
    pub games_online: u32,
    /// Substitute fixed sample numbers when the container listing fails.
    /// Meant for local development against no backend; off in production.
    #[serde(default)]
    pub mock_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    /// Chats allowed to start/stop the container. Empty means every allowed chat.
    #[serde(default)]
    pub control_chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bot_keywords: default_bot_keywords(),
            games_online: default_games_online(),
            mock_on_failure: false,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            control_chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl ProxmoxConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }

    /// Required settings that are absent or blank. The client is only built
    /// when this is empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.token_id.trim().is_empty() {
            missing.push("token_id");
        }
        if self.node.trim().is_empty() {
            missing.push("node");
        }
        if self.container_id.is_none() {
            missing.push("container_id");
        }
        missing
    }

    /// Token secret from the environment first, then from the file.
    pub fn resolve_token_secret(&self) -> Option<String> {
        non_empty_env(&self.token_secret_env).or_else(|| {
            self.token_secret
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }

        if let Some(proxmox) = &self.proxmox {
            validate_proxmox(proxmox)?;
        }
        validate_stats(&self.stats)?;
        validate_telegram(&self.telegram)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

// Blank required fields are reported by `missing_fields`, not here.
fn validate_proxmox(cfg: &ProxmoxConfig) -> Result<(), ConfigError> {
    if cfg.host.contains(char::is_whitespace) && !cfg.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "proxmox.host must not contain whitespace".to_string(),
        ));
    }
    if cfg.port == 0 {
        return Err(ConfigError::Validation(
            "proxmox.port must be in range 1..65535".to_string(),
        ));
    }
    if cfg.container_id == Some(0) {
        return Err(ConfigError::Validation(
            "proxmox.container_id must be > 0".to_string(),
        ));
    }
    if cfg.timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "proxmox.timeout_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_stats(cfg: &StatsConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for keyword in &cfg.bot_keywords {
        if keyword.trim().is_empty() {
            return Err(ConfigError::Validation(
                "stats.bot_keywords[*] must not be empty".to_string(),
            ));
        }
        if !seen.insert(keyword.to_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "stats.bot_keywords entry '{keyword}' is duplicated"
            )));
        }
    }
    Ok(())
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute must be >= 1".to_string(),
        ));
    }
    let allowed: HashSet<i64> = cfg.allowed_chat_ids.iter().copied().collect();
    if let Some(id) = cfg.control_chat_ids.iter().find(|id| !allowed.contains(id)) {
        return Err(ConfigError::Validation(format!(
            "telegram.control_chat_ids contains {id} which is not in allowed_chat_ids"
        )));
    }
    Ok(())
}

pub fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const fn default_proxmox_port() -> u16 {
    8006
}

fn default_token_secret_env() -> String {
    "PROXMOX_TOKEN_SECRET".to_string()
}

fn default_display_name() -> String {
    "Cartofia".to_string()
}

const fn default_timeout_secs() -> u64 {
    5
}

fn default_bot_keywords() -> Vec<String> {
    ["bot", "cartofia-bot", "discord"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_games_online() -> u32 {
    1
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxmox_config() -> ProxmoxConfig {
        ProxmoxConfig {
            host: "pve.lan".to_string(),
            port: 8006,
            token_id: "bot@pve!status".to_string(),
            token_secret: Some("secret".to_string()),
            token_secret_env: "PVEBOT_TEST_SECRET_UNSET".to_string(),
            node: "pve".to_string(),
            container_id: Some(2000),
            display_name: "Cartofia".to_string(),
            verify_tls: false,
            timeout_secs: 5,
        }
    }

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:5000".to_string(),
            proxmox: Some(proxmox_config()),
            stats: StatsConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }

    #[test]
    fn base_url_uses_https_and_api_prefix() {
        assert_eq!(
            proxmox_config().base_url(),
            "https://pve.lan:8006/api2/json"
        );
    }

    #[test]
    fn missing_proxmox_section_is_valid() {
        let mut cfg = valid_config();
        cfg.proxmox = None;
        cfg.validate()
            .expect("hypervisor settings are optional at startup");
    }

    #[test]
    fn zero_container_id_is_rejected() {
        let mut cfg = valid_config();
        if let Some(p) = cfg.proxmox.as_mut() {
            p.container_id = Some(0);
        }
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn partial_proxmox_section_loads() {
        let yaml = r#"
listen: "127.0.0.1:5000"
proxmox:
  host: pve.lan
  token_id: bot@pve!status
  container_id: 2000
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("partial section parses");
        cfg.validate().expect("partial section is not a startup error");
        let proxmox = cfg.proxmox.expect("section present");
        assert_eq!(proxmox.missing_fields(), vec!["node"]);

        let yaml = r#"
listen: "127.0.0.1:5000"
proxmox:
  host: ""
  token_id: " "
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("blank values parse");
        cfg.validate().expect("blank values are not a startup error");
        assert_eq!(
            cfg.proxmox.expect("section present").missing_fields(),
            vec!["host", "token_id", "node", "container_id"]
        );
    }

    #[test]
    fn complete_section_has_no_missing_fields() {
        assert!(proxmox_config().missing_fields().is_empty());
    }

    #[test]
    fn malformed_present_values_still_fail() {
        let mut cfg = valid_config();
        if let Some(p) = cfg.proxmox.as_mut() {
            p.host = "pve lan".to_string();
        }
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        if let Some(p) = cfg.proxmox.as_mut() {
            p.port = 0;
        }
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn control_chats_must_be_allowed() {
        let mut cfg = valid_config();
        cfg.telegram.allowed_chat_ids = vec![1];
        cfg.telegram.control_chat_ids = vec![2];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        cfg.telegram.control_chat_ids = vec![1];
        cfg.validate().expect("control chat is a subset of allowed chats");
    }

    #[test]
    fn inline_token_secret_used_when_env_missing() {
        let cfg = proxmox_config();
        std::env::remove_var(&cfg.token_secret_env);
        assert_eq!(cfg.resolve_token_secret().as_deref(), Some("secret"));

        let mut blank = proxmox_config();
        blank.token_secret = Some("   ".to_string());
        assert_eq!(blank.resolve_token_secret(), None);
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example yaml");
        cfg.validate().expect("example config is valid");
        let proxmox = cfg.proxmox.expect("example has proxmox section");
        assert_eq!(proxmox.timeout_secs, 5);
        assert_eq!(cfg.stats.bot_keywords.len(), 3);
    }
}
