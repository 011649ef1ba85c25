//! Configuration loading and validation for the autoscaler agent.
//!
//! Layered the same way as every long-lived service in this codebase:
//! a TOML file, then environment variable overrides, then whatever the CLI
//! passed explicitly. See [`Config::load`].

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process-wide fallbacks for `cooldown`/`evaluation_interval` on
    /// policies that don't specify them.
    pub policy_defaults: PolicyDefaultsConfig,
    /// Plugin manager settings: directory to scan for external plugin
    /// executables, and the desired-plugins table.
    pub plugins: PluginsConfig,
    /// High-availability mode and its tunables.
    pub high_availability: HaConfig,
    /// Administrative HTTP endpoint (`/health`, `/metrics`).
    pub http: HttpConfig,
    /// Number of evaluation-executor workers.
    #[serde(default = "default_executor_workers")]
    pub executor_workers: usize,
    /// Where the file-based policy source reads policy documents from.
    #[serde(default)]
    pub policy_source: PolicySourceConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    pub directory: String,
    #[serde(with = "duration_serde", default = "default_policy_source_poll_interval")]
    pub poll_interval: Duration,
}

fn default_policy_source_poll_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            directory: "./policies".to_string(),
            poll_interval: default_policy_source_poll_interval(),
        }
    }
}

fn default_executor_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefaultsConfig {
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
    #[serde(with = "duration_serde")]
    pub evaluation_interval: Duration,
}

impl Default for PolicyDefaultsConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for external (subprocess) plugin executables.
    pub directory: String,
    /// Desired plugins, keyed by the name checks/targets refer to.
    pub desired: Vec<DesiredPlugin>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: "./plugins".to_string(),
            desired: Vec::new(),
        }
    }
}

/// One entry in the desired-plugins table (§4.1 `load`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredPlugin {
    pub name: String,
    pub driver: String,
    pub kind: autoscaler_core::PluginKind,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Which `PoolFilter` implementation the HA coordinator runs, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HaConfig {
    Disabled,
    ConsistentHash {
        #[serde(default = "default_vnodes")]
        vnodes: usize,
    },
    Lease {
        #[serde(with = "duration_serde", default = "default_renew_period")]
        renew_period: Duration,
    },
}

fn default_vnodes() -> usize {
    autoscaler_core::hashring::DEFAULT_VNODES
}

fn default_renew_period() -> Duration {
    Duration::from_secs(10)
}

impl Default for HaConfig {
    fn default() -> Self {
        HaConfig::Disabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4646,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy_defaults: PolicyDefaultsConfig::default(),
            plugins: PluginsConfig::default(),
            high_availability: HaConfig::default(),
            http: HttpConfig::default(),
            executor_workers: default_executor_workers(),
            policy_source: PolicySourceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads a TOML config file, applies environment overrides, then
    /// validates the result.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("AUTOSCALER_HTTP_HOST") {
            self.http.host = host;
        }
        if let Ok(port) = env::var("AUTOSCALER_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.http.port = port;
            }
        }
        if let Ok(dir) = env::var("AUTOSCALER_PLUGIN_DIR") {
            self.plugins.directory = dir;
        }
        if let Ok(level) = env::var("AUTOSCALER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.policy_defaults.evaluation_interval.is_zero() {
            anyhow::bail!("policy_defaults.evaluation_interval must be > 0");
        }
        if self.http.port == 0 {
            anyhow::bail!("http.port must be between 1 and 65535");
        }
        if self.executor_workers == 0 {
            anyhow::bail!("executor_workers must be at least 1");
        }
        if let HaConfig::ConsistentHash { vnodes } = &self.high_availability {
            if *vnodes == 0 {
                anyhow::bail!("high_availability.vnodes must be at least 1");
            }
        }
        Ok(())
    }

    pub fn policy_defaults(&self) -> autoscaler_core::PolicyDefaults {
        autoscaler_core::PolicyDefaults {
            cooldown: self.policy_defaults.cooldown,
            evaluation_interval: self.policy_defaults.evaluation_interval,
        }
    }
}

/// (de)serializes a `Duration` from a humantime-ish string (`"30s"`,
/// `"5m"`), falling back to a bare integer number of seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    fn parse_duration(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        if let Some(secs) = raw.strip_suffix('s') {
            return secs
                .parse::<f64>()
                .map(Duration::from_secs_f64)
                .map_err(|e| e.to_string());
        }
        if let Some(mins) = raw.strip_suffix('m') {
            return mins
                .parse::<f64>()
                .map(|m| Duration::from_secs_f64(m * 60.0))
                .map_err(|e| e.to_string());
        }
        if let Some(hours) = raw.strip_suffix('h') {
            return hours
                .parse::<f64>()
                .map(|h| Duration::from_secs_f64(h * 3600.0))
                .map_err(|e| e.to_string());
        }
        raw.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_evaluation_interval() {
        let mut config = Config::default();
        config.policy_defaults.evaluation_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_duration_suffixes() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_serde")]
            d: Duration,
        }
        let thirty_s: Wrapper = toml::from_str("d = \"30s\"").unwrap();
        assert_eq!(thirty_s.d, Duration::from_secs(30));
        let five_min: Wrapper = toml::from_str("d = \"5m\"").unwrap();
        assert_eq!(five_min.d, Duration::from_secs(300));
    }
}
