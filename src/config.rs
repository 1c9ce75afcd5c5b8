//! Configuration management for Pacer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{PacerError, Result};
use crate::ratelimit::Backoff;

/// Prefix for environment overrides, e.g. `PACER__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "PACER";
/// Separator between nested keys in environment overrides.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Pacer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings used for limiters that are not listed by name
    #[serde(default)]
    pub defaults: LimiterConfig,

    /// Named limiters, typically one per external API
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings for a single rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Minimum spacing between the starts of consecutive operations
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Retries after a failed first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before a retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How retry delays grow
    #[serde(default)]
    pub backoff: Backoff,

    /// Randomize retry delays by +/-10%
    #[serde(default)]
    pub jitter: bool,

    /// Maximum number of waiting operations; unbounded when unset
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            jitter: false,
            max_queue_depth: None,
        }
    }
}

fn default_min_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl LimiterConfig {
    /// Minimum spacing as a `Duration`.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Base retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reject settings the limiter cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_depth == Some(0) {
            return Err(PacerError::Config(
                "max_queue_depth must be at least 1 when set".to_string(),
            ));
        }
        self.backoff
            .validate(self.retry_delay())
            .map_err(PacerError::Config)
    }
}

impl PacerConfig {
    /// Load configuration from an optional file plus `PACER__*` environment overrides.
    ///
    /// The file format is picked from the extension (YAML, TOML, JSON, ...).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: PacerConfig = builder.build()?.try_deserialize()?;
        config.normalized()
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PacerConfig =
            serde_yaml::from_str(yaml).map_err(|e| PacerError::Config(e.to_string()))?;
        config.normalized()
    }

    /// Lowercase limiter names and validate.
    ///
    /// The `config` crate lowercases keys from files and the environment, so
    /// names are compared case-insensitively everywhere.
    fn normalized(mut self) -> Result<Self> {
        let mut limiters = BTreeMap::new();
        for (name, limiter) in std::mem::take(&mut self.limiters) {
            let key = limiter_key(&name);
            if limiters.insert(key.clone(), limiter).is_some() {
                return Err(PacerError::Config(format!(
                    "limiter '{key}' is defined more than once (names are case-insensitive)"
                )));
            }
        }
        self.limiters = limiters;
        self.validate()?;
        Ok(self)
    }

    /// Validate the default and every named limiter.
    pub fn validate(&self) -> Result<()> {
        self.defaults
            .validate()
            .map_err(|e| scoped("defaults", e))?;
        for (name, limiter) in &self.limiters {
            limiter
                .validate()
                .map_err(|e| scoped(&format!("limiter '{name}'"), e))?;
        }
        Ok(())
    }

    /// Settings for `name`, falling back to the defaults.
    pub fn limiter(&self, name: &str) -> &LimiterConfig {
        self.limiters
            .get(&limiter_key(name))
            .unwrap_or(&self.defaults)
    }
}

/// Canonical form of a limiter name.
pub fn limiter_key(name: &str) -> String {
    name.to_lowercase()
}

/// Prefix a configuration error message with where it came from.
fn scoped(scope: &str, err: PacerError) -> PacerError {
    match err {
        PacerError::Config(msg) => PacerError::Config(format!("{scope}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PacerConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.defaults.min_interval(), Duration::from_millis(100));
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.defaults.retry_delay(), Duration::from_millis(1000));
        assert_eq!(config.defaults.backoff, Backoff::Fixed);
        assert!(config.limiters.is_empty());
    }

    #[test]
    fn test_parse_limiters() {
        let yaml = r#"
logging:
  level: debug
limiters:
  twitch:
    min_interval_ms: 250
    max_retries: 5
    retry_delay_ms: 200
    backoff:
      strategy: exponential
      multiplier: 2.0
      max_delay_ms: 5000
    jitter: true
  leaderboard:
    max_queue_depth: 64
"#;
        let config = PacerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.limiters.len(), 2);

        let twitch = &config.limiters["twitch"];
        assert_eq!(twitch.min_interval_ms, 250);
        assert_eq!(twitch.max_retries, 5);
        assert!(twitch.jitter);
        assert_eq!(
            twitch.backoff,
            Backoff::Exponential {
                multiplier: 2.0,
                max_delay_ms: 5000,
            }
        );

        let leaderboard = &config.limiters["leaderboard"];
        assert_eq!(leaderboard.max_queue_depth, Some(64));
        assert_eq!(leaderboard.max_retries, 3);
    }

    #[test]
    fn test_limiter_falls_back_to_defaults() {
        let yaml = r#"
defaults:
  min_interval_ms: 500
limiters:
  twitch:
    min_interval_ms: 50
"#;
        let config = PacerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter("twitch").min_interval_ms, 50);
        assert_eq!(config.limiter("unknown").min_interval_ms, 500);
    }

    #[test]
    fn test_rejects_zero_queue_depth() {
        let yaml = r#"
limiters:
  twitch:
    max_queue_depth: 0
"#;
        let err = PacerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("twitch"));
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let yaml = r#"
defaults:
  backoff:
    strategy: exponential
    multiplier: 0.5
"#;
        assert!(matches!(
            PacerConfig::from_yaml(yaml),
            Err(PacerError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("pacer-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiters:\n  speedrun:\n    min_interval_ms: 600\n    max_retries: 1\n",
        )
        .unwrap();

        let config = PacerConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        let speedrun = &config.limiters["speedrun"];
        assert_eq!(speedrun.min_interval_ms, 600);
        assert_eq!(speedrun.max_retries, 1);
        assert_eq!(speedrun.retry_delay_ms, 1000);
    }

    #[test]
    fn test_limiter_names_are_case_insensitive() {
        let yaml = r#"
limiters:
  SpeedrunCom:
    min_interval_ms: 700
"#;
        let config = PacerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiters.keys().collect::<Vec<_>>(), vec!["speedruncom"]);
        assert_eq!(config.limiter("SpeedrunCom").min_interval_ms, 700);
        assert_eq!(config.limiter("speedruncom").min_interval_ms, 700);
    }

    #[test]
    fn test_file_limiter_names_match_yaml() {
        let path = std::env::temp_dir().join(format!("pacer-case-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiters:\n  SpeedrunCom:\n    min_interval_ms: 700\n").unwrap();

        let config = PacerConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiters.keys().collect::<Vec<_>>(), vec!["speedruncom"]);
        assert_eq!(config.limiter("SpeedrunCom").min_interval_ms, 700);
    }

    #[test]
    fn test_rejects_names_differing_only_in_case() {
        let yaml = r#"
limiters:
  Twitch:
    min_interval_ms: 100
  twitch:
    min_interval_ms: 200
"#;
        let err = PacerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_environment_overrides() {
        // Only this test sets this variable.
        std::env::set_var("PACER__DEFAULTS__MAX_RETRIES", "7");
        let config = PacerConfig::load(None);
        std::env::remove_var("PACER__DEFAULTS__MAX_RETRIES");

        let config = config.unwrap();
        assert_eq!(config.defaults.max_retries, 7);
        assert_eq!(config.defaults.min_interval_ms, 100);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(PacerConfig::from_file("/nonexistent/pacer.yaml").is_err());
    }
}
