use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::source::{default_sources, SourceDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Fallback chain in priority order.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Seconds without audio after `loadfile` before the stream counts as failed.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

/// What a script load does when another load already owns the script namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionPolicy {
    /// Wait for the in-flight load to finish.
    #[default]
    Queue,
    /// Fail immediately with a plugin load error.
    FailFast,
}

/// HTTP and plugin settings shared by every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound for one script load + capability invocation.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default)]
    pub exclusive: ExclusionPolicy,
}

impl ResolverConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            script_timeout_ms: default_script_timeout_ms(),
            exclusive: ExclusionPolicy::default(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.5
}

fn default_start_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    concat!("songfall/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_request_timeout_ms() -> u64 {
    15000
}

fn default_script_timeout_ms() -> u64 {
    20000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing defaults there if it does not exist.
    pub fn load_from(config_path: &std::path::Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.sources.is_empty() {
            anyhow::bail!("config lists no sources; at least one is required");
        }
        Ok(config)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            mpv: MpvConfig::default(),
            resolver: ResolverConfig::default(),
            sources: default_sources(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.sources.len(), 7);
        assert_eq!(config.resolver.exclusive, ExclusionPolicy::Queue);
        assert!(config.daemon.state_file.ends_with("songfall/state.json"));
    }

    #[test]
    fn test_parse_sources_in_order() {
        let config = Config::parse(
            r#"
            [resolver]
            exclusive = "fail_fast"
            script_timeout_ms = 500

            [[sources]]
            name = "listing"
            url = "http://localhost/list.json"
            kind = "json"

            [[sources]]
            name = "kuwo"
            url = "http://localhost/kuwo.js"
            kind = "js"
            platform = "kuwo"
            "#,
        )
        .unwrap();

        assert_eq!(config.resolver.exclusive, ExclusionPolicy::FailFast);
        assert_eq!(config.resolver.script_timeout(), Duration::from_millis(500));
        assert_eq!(config.resolver.request_timeout_ms, 15000);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].name, "listing");
        assert_eq!(config.sources[0].platform, "general");
        assert_eq!(config.sources[1].kind, SourceKind::Script);
    }

    #[test]
    fn test_empty_sources_rejected() {
        let err = Config::parse("sources = []").unwrap_err();
        assert!(err.to_string().contains("no sources"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let first = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let second = Config::load_from(&path).unwrap();
        assert_eq!(first.sources, second.sources);
        assert_eq!(first.mpv.start_timeout_secs, second.mpv.start_timeout_secs);
    }
}
