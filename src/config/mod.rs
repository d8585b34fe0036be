use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::lb::BackendCheckConfig;

/// Default configuration file path when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/socks5lb.yml";

/// A single listener section (`addr` empty or absent means disabled)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl ListenConfig {
    /// The configured address, treating an empty string as "not configured"
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref().filter(|a| !a.trim().is_empty())
    }
}

/// Addresses for all server components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP admin interface (optional)
    #[serde(default)]
    pub http: ListenConfig,

    /// Transparent proxy listener (optional, Linux only)
    #[serde(default)]
    pub tproxy: ListenConfig,

    /// SOCKS5 passthrough listener
    #[serde(default)]
    pub socks5: ListenConfig,
}

/// One upstream SOCKS5 proxy as described in configuration or the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend address (host:port)
    pub addr: String,

    /// Optional SOCKS5 username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional SOCKS5 password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Health check parameters
    #[serde(default)]
    pub check_config: BackendCheckConfig,
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("failed to parse YAML configuration")?;

    Ok(config)
}

/// Retrieve an environment variable, falling back to a default if unset.
/// The result is whitespace-trimmed for cleaner configuration handling.
pub fn env_or(name: &str, default: &str) -> String {
    // Pick up a .env file if one exists; ignore when absent
    let _ = dotenvy::dotenv();

    let value = std::env::var(name).unwrap_or_default();
    if value.trim().is_empty() {
        default.trim().to_string()
    } else {
        value.trim().to_string()
    }
}

/// Retrieve a duration in seconds from an environment variable.
/// Unset or unparsable values fall back to the default.
pub fn secs_from_env(name: &str, default_secs: u64) -> Duration {
    let raw = env_or(name, &default_secs.to_string());
    let secs = raw.parse::<u64>().unwrap_or_else(|e| {
        tracing::debug!(
            "invalid value '{}' for {}: {}, using default {}s",
            raw,
            name,
            e,
            default_secs
        );
        default_secs
    });

    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
server:
  http:
    addr: "0.0.0.0:8080"
  socks5:
    addr: "0.0.0.0:1080"
  tproxy:
    addr: "0.0.0.0:8848"

backends:
  - addr: "192.168.100.254:1086"
    check_config:
      check_url: "https://www.google.com/robots.txt"
      timeout: 5
  - addr: "10.0.20.254:1086"
    username: "user"
    password: "pass"
    check_config:
      initial_alive: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.socks5.addr(), Some("0.0.0.0:1080"));
        assert_eq!(config.server.http.addr(), Some("0.0.0.0:8080"));
        assert_eq!(config.server.tproxy.addr(), Some("0.0.0.0:8848"));

        assert_eq!(config.backends.len(), 2);
        let first = &config.backends[0];
        assert_eq!(first.addr, "192.168.100.254:1086");
        assert_eq!(
            first.check_config.check_url.as_deref(),
            Some("https://www.google.com/robots.txt")
        );
        assert_eq!(first.check_config.timeout, 5);
        assert!(!first.check_config.initial_alive);

        let second = &config.backends[1];
        assert_eq!(second.username.as_deref(), Some("user"));
        assert!(second.check_config.initial_alive);
        assert!(second.check_config.check_url.is_none());
    }

    #[test]
    fn test_missing_sections_default() {
        let config: Config = serde_yaml::from_str("backends: []").unwrap();

        assert!(config.server.socks5.addr().is_none());
        assert!(config.server.http.addr().is_none());
        assert!(config.server.tproxy.addr().is_none());
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_empty_addr_means_disabled() {
        let yaml = r#"
server:
  socks5:
    addr: ""
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.server.socks5.addr().is_none());
    }

    #[test]
    fn test_secs_from_env_fallbacks() {
        std::env::remove_var("SOCKS5LB_TEST_UNSET");
        assert_eq!(
            secs_from_env("SOCKS5LB_TEST_UNSET", 60),
            Duration::from_secs(60)
        );

        std::env::set_var("SOCKS5LB_TEST_INVALID", "not-a-number");
        assert_eq!(
            secs_from_env("SOCKS5LB_TEST_INVALID", 300),
            Duration::from_secs(300)
        );

        std::env::set_var("SOCKS5LB_TEST_VALID", " 42 ");
        assert_eq!(
            secs_from_env("SOCKS5LB_TEST_VALID", 42),
            Duration::from_secs(42)
        );
    }
}
