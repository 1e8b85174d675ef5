use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub target: TargetConfig,
    /// Directory for the rolling log file, alongside console output.
    pub log_dir: String,
    /// Reason phrase on the `HTTP/1.1 101` status line. The legacy peer
    /// ecosystem sends a decorative banner here; strict WebSocket clients
    /// want the standard phrase.
    pub reason_phrase: String,
    /// No idle timeout when absent: an idle relay holds its sockets until
    /// a peer closes, matching the legacy behavior.
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            target: TargetConfig::default(),
            log_dir: "/var/log/proxy".to_string(),
            reason_phrase: "Switching Protocols".to_string(),
            idle_timeout_secs: None,
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 10015,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1194,
        }
    }
}

impl Config {
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

impl TargetConfig {
    /// The `host:port` form used when a client supplies no `X-Real-Host`.
    #[must_use]
    pub fn to_target_spec(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loads configuration from `path`. The file is optional: a missing file
/// yields the defaults, while an unreadable or malformed file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_legacy_deployment() {
        let config = Config::default();
        assert_eq!(config.listen.ip, "0.0.0.0");
        assert_eq!(config.listen.port, 10015);
        assert_eq!(config.target.to_target_spec(), "127.0.0.1:1194");
        assert_eq!(config.reason_phrase, "Switching Protocols");
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/ws-tunnel.toml")).unwrap();
        assert_eq!(config.listen.port, 10015);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            idle_timeout_secs = 60

            [target]
            host = "10.0.0.5"
            port = 1194
            "#,
        )
        .unwrap();
        assert_eq!(config.target.host, "10.0.0.5");
        assert_eq!(config.listen.port, 10015);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
    }
}
