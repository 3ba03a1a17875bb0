use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the completion endpoint
    pub api_key: Option<String>,

    /// Model name used to build the completion endpoint
    pub model: String,

    /// Base URL of the generative language API
    pub api_base_url: String,

    /// Same-origin proxy; when set the client never sends the key itself
    pub proxy_url: Option<String>,

    /// Request lifecycle tuning
    pub request: RequestConfig,

    /// Typing effect tuning
    pub typing: TypingConfig,

    /// Proxy server settings
    pub server: ServerConfig,

    /// Directory holding config.toml
    #[serde(skip)]
    pub config_home: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub chars_per_tick: usize,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 3,
            retry_backoff_secs: 2,
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            chars_per_tick: 1,
            tick_interval_ms: 10,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        Config {
            api_key: None,
            model: "gemini-1.5-flash".to_string(),
            api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            proxy_url: None,
            request: RequestConfig::default(),
            typing: TypingConfig::default(),
            server: ServerConfig::default(),
            config_home: home.join(".gemini-chat"),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl TypingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Config {
    /// Load configuration from ~/.gemini-chat/config.toml
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Self::load_from(&home.join(".gemini-chat"))
    }

    /// Load configuration from an explicit directory
    pub fn load_from(config_home: &Path) -> Result<Self> {
        let config_path = config_home.join("config.toml");

        fs::create_dir_all(config_home)
            .context("Failed to create configuration directory")?;

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content)
                .context("Failed to parse config file")?
        } else {
            Config::default()
        };

        config.config_home = config_home.to_path_buf();

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.config_home)
            .context("Failed to create configuration directory")?;
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(self.config_path(), content)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_home.join("config.toml")
    }

    /// Full URL of the generateContent endpoint for the configured model
    pub fn completion_endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base_url.trim_end_matches('/'),
            self.model
        )
    }

    /// Check if API key is configured
    pub fn has_api_key(&self) -> bool {
        self.get_api_key().is_some()
    }

    /// Get API key from environment or config
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }

    /// Update API key
    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_request_lifecycle_constants() {
        let config = Config::default();
        assert_eq!(config.request.timeout(), Duration::from_secs(10));
        assert_eq!(config.request.max_retries, 3);
        assert_eq!(config.request.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.typing.chars_per_tick, 1);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn completion_endpoint_joins_model() {
        let config = Config {
            api_base_url: "http://localhost:9999/v1beta/".to_string(),
            model: "gemini-test".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.completion_endpoint(),
            "http://localhost:9999/v1beta/models/gemini-test:generateContent"
        );
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(dir.path()).unwrap();
        config.set_api_key("file-key".to_string());
        config.request.max_retries = 5;
        config.save().unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("file-key"));
        assert_eq!(loaded.request.max_retries, 5);
        assert_eq!(loaded.request.timeout_secs, 10);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "model = \"gemini-pro\"\n[typing]\ntick_interval_ms = 25\n",
        )
        .unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.model, "gemini-pro");
        assert_eq!(loaded.typing.tick_interval(), Duration::from_millis(25));
        assert_eq!(loaded.typing.chars_per_tick, 1);
        assert_eq!(loaded.server.port, 3000);
    }
}
