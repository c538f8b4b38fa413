use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Main configuration structure for the flowchat client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Unset means the HTTP client default.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Highest attempt index still fetched; attempts run from 0 through this.
    pub max_attempts: u32,
    /// Consecutive fetch errors that end polling early. Unset retries
    /// errors within the attempt budget like any other observation.
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: None,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_attempts: 20,
            max_consecutive_errors: None,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            path: Path::new(&home).join(".flowchat").join("identity.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    /// ALWAYS returns a valid config - never fails
    pub fn load() -> Self {
        for path in ["../.env", ".env"] {
            if dotenvy::from_path(path).is_ok() {
                tracing::debug!("Loaded .env from: {}", path);
                break;
            }
        }

        let config_path =
            env::var("FLOWCHAT_CONFIG_PATH").unwrap_or_else(|_| "flowchat.yaml".to_string());

        let mut config = Self::from_file(Path::new(&config_path));
        config.apply_env_overrides();

        if let Err(e) = config.validate() {
            tracing::warn!("Config validation warnings: {} - continuing anyway", e);
        }

        config
    }

    fn from_file(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("Config file not found at {} - using defaults", path.display());
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to parse config file {}: {} - using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::error!(
                    "Failed to read config file {}: {} - using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // API overrides; the web front end's variable is honoured too
        if let Some(url) = lookup("FLOWCHAT_API_URL").or_else(|| lookup("NEXT_PUBLIC_API_URL")) {
            self.api.base_url = url;
        }
        if let Some(timeout) = lookup("FLOWCHAT_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = timeout.parse()
        {
            self.api.request_timeout_secs = Some(secs);
        }

        // Poller overrides
        if let Some(interval) = lookup("FLOWCHAT_POLL_INTERVAL_MS")
            && let Ok(ms) = interval.parse()
        {
            self.poller.interval_ms = ms;
        }
        if let Some(max) = lookup("FLOWCHAT_POLL_MAX_ATTEMPTS")
            && let Ok(max) = max.parse()
        {
            self.poller.max_attempts = max;
        }
        if let Some(max) = lookup("FLOWCHAT_POLL_MAX_ERRORS")
            && let Ok(max) = max.parse()
        {
            self.poller.max_consecutive_errors = Some(max);
        }

        if let Some(path) = lookup("FLOWCHAT_IDENTITY_PATH") {
            self.identity.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("FLOWCHAT_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.api.base_url.trim();
        if url.is_empty() {
            return Err("API base URL cannot be empty".into());
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("API base URL must be http(s): {url}").into());
        }
        if self.poller.interval_ms == 0 {
            return Err("Poll interval cannot be 0".into());
        }
        if self.poller.max_consecutive_errors == Some(0) {
            return Err("poller.max_consecutive_errors must be at least 1 when set".into());
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn api_base_url(&self) -> String {
        self.api.base_url.trim().trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.api.request_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_service_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.api.base_url, DEFAULT_API_URL);
        assert_eq!(cfg.poller.interval(), Duration::from_secs(3));
        assert_eq!(cfg.poller.max_attempts, 20);
        assert_eq!(cfg.poller.max_consecutive_errors, None);
        assert!(cfg.request_timeout().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let cfg = Config::from_yaml(
            "api:\n  base_url: https://flows.example.com/\npoller:\n  interval_ms: 500\n  max_attempts: 5\n",
        )
        .expect("yaml parses");
        assert_eq!(cfg.api_base_url(), "https://flows.example.com");
        assert_eq!(cfg.poller.interval_ms, 500);
        assert_eq!(cfg.poller.max_attempts, 5);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_overrides_prefer_flowchat_url() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FLOWCHAT_API_URL", "http://api.internal:9000"),
            ("NEXT_PUBLIC_API_URL", "http://ignored:1"),
            ("FLOWCHAT_POLL_MAX_ATTEMPTS", "3"),
            ("FLOWCHAT_POLL_MAX_ERRORS", "2"),
            ("FLOWCHAT_POLL_INTERVAL_MS", "not-a-number"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.api.base_url, "http://api.internal:9000");
        assert_eq!(cfg.poller.max_attempts, 3);
        assert_eq!(cfg.poller.max_consecutive_errors, Some(2));
        assert_eq!(cfg.poller.interval_ms, 3000);
    }

    #[test]
    fn test_next_public_url_fallback() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| {
            (k == "NEXT_PUBLIC_API_URL").then(|| "http://legacy:8000".to_string())
        });
        assert_eq!(cfg.api.base_url, "http://legacy:8000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.api.base_url = "ftp://nope".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.poller.interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.poller.max_consecutive_errors = Some(0);
        assert!(cfg.validate().is_err());
    }
}
