use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Top-level configuration for the httpscope agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kernel program configuration.
    #[serde(default)]
    pub bpf: BpfConfig,

    /// HTTP aggregation configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Kernel program configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BpfConfig {
    /// Path to the compiled HTTP object file.
    #[serde(default = "default_object_path")]
    pub object_path: PathBuf,

    /// Capacity of the in-process notification queue. Default: 1024.
    #[serde(default = "default_notification_queue_size")]
    pub notification_queue_size: usize,
}

/// HTTP aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Maximum number of distinct keys held between two drains. New keys
    /// beyond this are dropped. Default: 100000.
    #[serde(default = "default_max_stats_buffered")]
    pub max_stats_buffered: usize,

    /// How long a request-only or response-only half waits for its
    /// counterpart. Default: 30s.
    #[serde(default = "default_incomplete_buffer_timeout", with = "humantime_serde")]
    pub incomplete_buffer_timeout: Duration,

    /// Path rewrite rules, applied in order.
    #[serde(default)]
    pub replace_rules: Vec<ReplaceRule>,

    /// How often the agent drains stats. Default: 10s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
}

/// Rewrites request paths matching `pattern`. An empty `repl` rejects the
/// transaction instead.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReplaceRule {
    pub pattern: String,
    #[serde(default)]
    pub repl: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_object_path() -> PathBuf {
    PathBuf::from("/usr/lib/httpscope/http.bpf.o")
}

fn default_notification_queue_size() -> usize {
    1024
}

fn default_max_stats_buffered() -> usize {
    100_000
}

fn default_incomplete_buffer_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bpf: BpfConfig::default(),
            http: HttpConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: default_object_path(),
            notification_queue_size: default_notification_queue_size(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_stats_buffered: default_max_stats_buffered(),
            incomplete_buffer_timeout: default_incomplete_buffer_timeout(),
            replace_rules: Vec::new(),
            report_interval: default_report_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.bpf.notification_queue_size == 0 {
            bail!("bpf.notification_queue_size must be positive");
        }

        self.http.validate()?;

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_stats_buffered == 0 {
            bail!("http.max_stats_buffered must be positive");
        }

        if self.incomplete_buffer_timeout.is_zero() {
            bail!("http.incomplete_buffer_timeout must be positive");
        }

        if self.report_interval.is_zero() {
            bail!("http.report_interval must be positive");
        }

        for rule in &self.replace_rules {
            rule.compile()?;
        }

        Ok(())
    }
}

impl ReplaceRule {
    pub fn compile(&self) -> Result<Regex> {
        if self.pattern.is_empty() {
            bail!("http.replace_rules: pattern is required");
        }
        Regex::new(&self.pattern)
            .with_context(|| format!("http.replace_rules: invalid pattern {:?}", self.pattern))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.bpf.notification_queue_size, 1024);
        assert_eq!(cfg.http.max_stats_buffered, 100_000);
        assert_eq!(cfg.http.incomplete_buffer_timeout, Duration::from_secs(30));
        assert_eq!(cfg.http.report_interval, Duration::from_secs(10));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
bpf:
  object_path: /tmp/http.o
  notification_queue_size: 64
http:
  max_stats_buffered: 500
  incomplete_buffer_timeout: 5s
  report_interval: 1m
  replace_rules:
    - pattern: "/users/[0-9]+"
      repl: "/users/?"
    - pattern: "^/health"
health:
  addr: "127.0.0.1:9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.bpf.object_path, PathBuf::from("/tmp/http.o"));
        assert_eq!(cfg.bpf.notification_queue_size, 64);
        assert_eq!(cfg.http.max_stats_buffered, 500);
        assert_eq!(cfg.http.incomplete_buffer_timeout, Duration::from_secs(5));
        assert_eq!(cfg.http.report_interval, Duration::from_secs(60));
        assert_eq!(cfg.http.replace_rules.len(), 2);
        assert_eq!(cfg.http.replace_rules[1].repl, "");
        assert_eq!(cfg.health.addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.http.max_stats_buffered, 100_000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut cfg = Config::default();
        cfg.bpf.notification_queue_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.http.max_stats_buffered = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.http.incomplete_buffer_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut cfg = Config::default();
        cfg.http.replace_rules.push(ReplaceRule {
            pattern: "([".to_string(),
            repl: "x".to_string(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));

        cfg.http.replace_rules[0].pattern.clear();
        assert!(cfg.validate().is_err());
    }
}
