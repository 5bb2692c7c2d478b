//! Configuration loading and validation.
//!
//! Every field has a default, so the relay runs with no config file at all.
//! Values are layered: built-in defaults, then an optional YAML file (with
//! `${VAR}` interpolation), then environment-style overrides such as
//! `WATCH_DIR` or `MAX_CONCURRENT_REQUESTS`.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{
    ConfigError, EmptySupervisorCommandSnafu, EnvInterpolationSnafu, InvalidEndpointSnafu,
    InvalidEnvValueSnafu, ReadFileSnafu, TooManyConcurrentSnafu, UnsupportedSchemeSnafu,
    YamlParseSnafu, ZeroConcurrencySnafu, ZeroDurationSnafu, ZeroFailureThresholdSnafu,
};

pub use vars::{Interpolated, interpolate, interpolate_with};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Directory watching and file stability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Directory the producer drops event files into. Created if absent.
    #[serde(default = "default_watch_dir")]
    pub dir: PathBuf,
    /// Watch subdirectories as well.
    #[serde(default)]
    pub recursive: bool,
    /// How often the watch handle is torn down and recreated.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Stability gate poll interval.
    #[serde(default = "default_stability_poll_ms")]
    pub stability_poll_ms: u64,
    /// Stability gate overall timeout, after which the file is read anyway.
    #[serde(default = "default_stability_timeout_ms")]
    pub stability_timeout_ms: u64,
    /// How long a file's size must stay unchanged before the watch layer
    /// reports it.
    #[serde(default = "default_write_finish_threshold_ms")]
    pub write_finish_threshold_ms: u64,
    /// Poll interval for the write-finish check.
    #[serde(default = "default_write_finish_poll_ms")]
    pub write_finish_poll_ms: u64,
    /// Repeat notifications for a path inside this window are dropped.
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: default_watch_dir(),
            recursive: false,
            refresh_interval_secs: default_refresh_interval_secs(),
            stability_poll_ms: default_stability_poll_ms(),
            stability_timeout_ms: default_stability_timeout_ms(),
            write_finish_threshold_ms: default_write_finish_threshold_ms(),
            write_finish_poll_ms: default_write_finish_poll_ms(),
            duplicate_window_ms: default_duplicate_window_ms(),
        }
    }
}

impl WatchConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    pub fn write_finish_threshold(&self) -> Duration {
        Duration::from_millis(self.write_finish_threshold_ms)
    }

    pub fn write_finish_poll(&self) -> Duration {
        Duration::from_millis(self.write_finish_poll_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("/var/lib/podpingd/podpings")
}

fn default_refresh_interval_secs() -> u64 {
    120
}

fn default_stability_poll_ms() -> u64 {
    50
}

fn default_stability_timeout_ms() -> u64 {
    1000
}

fn default_write_finish_threshold_ms() -> u64 {
    1000
}

fn default_write_finish_poll_ms() -> u64 {
    50
}

fn default_duplicate_window_ms() -> u64 {
    5000
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    /// Base URL; each event is POSTed to `{endpoint}/{reason}`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Maximum number of requests in flight at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Per-attempt request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt fails.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ForwardConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The endpoint as a parsed, validated URL.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.endpoint).context(InvalidEndpointSnafu {
            endpoint: &self.endpoint,
        })?;
        ensure!(
            matches!(url.scheme(), "http" | "https"),
            UnsupportedSchemeSnafu {
                endpoint: &self.endpoint,
                scheme: url.scheme(),
            }
        );
        Ok(url)
    }
}

fn default_endpoint() -> String {
    "http://localhost:3000/podping".to_string()
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Producer health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Idle time after which staleness warnings start.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    /// Idle time after which the producer is restarted.
    #[serde(default = "default_restart_after_inactivity_secs")]
    pub restart_after_inactivity_secs: u64,
    /// Minimum spacing between staleness warnings.
    #[serde(default = "default_log_throttle_secs")]
    pub log_throttle_secs: u64,
    /// Producer-related forwarding failures in a row before recovery.
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,
    /// Cadence of the staleness check.
    #[serde(default = "default_staleness_check_secs")]
    pub staleness_check_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            restart_after_inactivity_secs: default_restart_after_inactivity_secs(),
            log_throttle_secs: default_log_throttle_secs(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            staleness_check_secs: default_staleness_check_secs(),
        }
    }
}

impl HealthConfig {
    pub fn staleness_check(&self) -> Duration {
        Duration::from_secs(self.staleness_check_secs)
    }
}

fn default_inactivity_threshold_secs() -> u64 {
    300
}

fn default_restart_after_inactivity_secs() -> u64 {
    900
}

fn default_log_throttle_secs() -> u64 {
    60
}

fn default_consecutive_failure_threshold() -> u32 {
    5
}

fn default_staleness_check_secs() -> u64 {
    15
}

/// Producer restart settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryConfig {
    /// The producer's config file holding the `start_datetime` line.
    #[serde(default = "default_producer_config")]
    pub producer_config: PathBuf,
    /// Program name known to the process supervisor.
    #[serde(default = "default_program")]
    pub program: String,
    /// Supervisor control command; the action and program are appended.
    #[serde(default = "default_supervisor_command")]
    pub supervisor_command: Vec<String>,
    /// How far before "now" the producer resumes scanning after a restart.
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            producer_config: default_producer_config(),
            program: default_program(),
            supervisor_command: default_supervisor_command(),
            lookback_minutes: default_lookback_minutes(),
        }
    }
}

fn default_producer_config() -> PathBuf {
    PathBuf::from("/etc/podpingd/config.toml")
}

fn default_program() -> String {
    "podpingd".to_string()
}

fn default_supervisor_command() -> Vec<String> {
    vec!["sudo".to_string(), "supervisorctl".to_string()]
}

fn default_lookback_minutes() -> u64 {
    10
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from an optional YAML file plus the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, interpolating `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml(&interpolate(&content))
    }

    fn from_yaml(interpolated: &Interpolated) -> Result<Self, ConfigError> {
        if !interpolated.is_ok() {
            return EnvInterpolationSnafu {
                message: interpolated.errors.join("\n"),
            }
            .fail();
        }
        // An empty file deserializes to unit, not to an empty mapping.
        if interpolated.text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let env = Overrides { lookup: &lookup };

        env.set("WATCH_DIR", &mut self.watch.dir)?;
        env.set_bool("WATCH_RECURSIVE", &mut self.watch.recursive)?;

        env.set("TARGET_ENDPOINT", &mut self.forward.endpoint)?;
        env.set(
            "MAX_CONCURRENT_REQUESTS",
            &mut self.forward.max_concurrent_requests,
        )?;
        env.set("REQUEST_TIMEOUT_MS", &mut self.forward.request_timeout_ms)?;
        env.set("RETRY_COUNT", &mut self.forward.retry_count)?;
        env.set("RETRY_DELAY_MS", &mut self.forward.retry_delay_ms)?;

        env.set(
            "INACTIVITY_THRESHOLD_SECS",
            &mut self.health.inactivity_threshold_secs,
        )?;
        env.set(
            "RESTART_AFTER_INACTIVITY_SECS",
            &mut self.health.restart_after_inactivity_secs,
        )?;
        env.set("LOG_THROTTLE_SECS", &mut self.health.log_throttle_secs)?;
        env.set(
            "CONSECUTIVE_FAILURE_THRESHOLD",
            &mut self.health.consecutive_failure_threshold,
        )?;
        env.set("STALENESS_CHECK_SECS", &mut self.health.staleness_check_secs)?;

        env.set(
            "RESTART_LOOKBACK_MINUTES",
            &mut self.recovery.lookback_minutes,
        )?;
        env.set("PRODUCER_CONFIG_PATH", &mut self.recovery.producer_config)?;
        env.set("PRODUCER_PROGRAM", &mut self.recovery.program)?;
        if let Some(command) = lookup("SUPERVISOR_COMMAND") {
            self.recovery.supervisor_command =
                command.split_whitespace().map(str::to_string).collect();
        }

        env.set_bool("METRICS_ENABLED", &mut self.metrics.enabled)?;
        env.set("METRICS_ADDRESS", &mut self.metrics.address)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.forward.endpoint_url()?;
        ensure!(self.forward.max_concurrent_requests > 0, ZeroConcurrencySnafu);
        ensure!(
            self.forward.max_concurrent_requests <= Semaphore::MAX_PERMITS,
            TooManyConcurrentSnafu {
                value: self.forward.max_concurrent_requests,
                max: Semaphore::MAX_PERMITS,
            }
        );
        ensure!(
            self.health.consecutive_failure_threshold > 0,
            ZeroFailureThresholdSnafu
        );
        ensure!(
            !self.recovery.supervisor_command.is_empty(),
            EmptySupervisorCommandSnafu
        );

        let intervals = [
            ("watch.refresh_interval_secs", self.watch.refresh_interval_secs),
            ("watch.stability_poll_ms", self.watch.stability_poll_ms),
            ("watch.stability_timeout_ms", self.watch.stability_timeout_ms),
            ("watch.write_finish_poll_ms", self.watch.write_finish_poll_ms),
            ("forward.request_timeout_ms", self.forward.request_timeout_ms),
            ("health.staleness_check_secs", self.health.staleness_check_secs),
        ];
        for (field, value) in intervals {
            ensure!(value > 0, ZeroDurationSnafu { field });
        }
        Ok(())
    }
}

/// Typed reads of environment-style overrides.
struct Overrides<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn set<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = (self.lookup)(key) {
            *target = raw.trim().parse().map_err(|e: T::Err| {
                InvalidEnvValueSnafu {
                    key,
                    value: &raw,
                    message: e.to_string(),
                }
                .build()
            })?;
        }
        Ok(())
    }

    fn set_bool(&self, key: &str, target: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = (self.lookup)(key) {
            *target = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return InvalidEnvValueSnafu {
                        key,
                        value: raw,
                        message: "expected a boolean",
                    }
                    .fail();
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.forward.max_concurrent_requests, 10);
        assert_eq!(config.health.consecutive_failure_threshold, 5);
        assert_eq!(config.watch.refresh_interval(), Duration::from_secs(120));
        assert_eq!(config.watch.stability_poll(), Duration::from_millis(50));
        assert_eq!(config.watch.stability_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.recovery.supervisor_command,
            vec!["sudo".to_string(), "supervisorctl".to_string()]
        );
    }

    #[test]
    fn test_yaml_partial_config_keeps_defaults() {
        let yaml = r#"
watch:
  dir: /tmp/podpings
forward:
  endpoint: "https://hooks.example.com/podping"
  retry_count: 1
health:
  consecutive_failure_threshold: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.watch.dir, PathBuf::from("/tmp/podpings"));
        assert_eq!(config.forward.retry_count, 1);
        assert_eq!(config.forward.max_concurrent_requests, 10);
        assert_eq!(config.health.consecutive_failure_threshold, 3);
        assert_eq!(config.health.restart_after_inactivity_secs, 900);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "forward:\n  endpoitn: http://x\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = Config::from_yaml(&interpolate_with("  \n", |_| None)).unwrap();
        assert_eq!(config.forward.endpoint, default_endpoint());
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("WATCH_DIR", "/srv/events"),
                ("TARGET_ENDPOINT", "http://api.local/notify"),
                ("MAX_CONCURRENT_REQUESTS", "2"),
                ("CONSECUTIVE_FAILURE_THRESHOLD", " 7 "),
                ("RESTART_LOOKBACK_MINUTES", "30"),
                ("SUPERVISOR_COMMAND", "systemctl --user"),
                ("METRICS_ENABLED", "no"),
            ]))
            .unwrap();

        assert_eq!(config.watch.dir, PathBuf::from("/srv/events"));
        assert_eq!(config.forward.endpoint, "http://api.local/notify");
        assert_eq!(config.forward.max_concurrent_requests, 2);
        assert_eq!(config.health.consecutive_failure_threshold, 7);
        assert_eq!(config.recovery.lookback_minutes, 30);
        assert_eq!(
            config.recovery.supervisor_command,
            vec!["systemctl".to_string(), "--user".to_string()]
        );
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_invalid_override_names_key() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("RETRY_COUNT", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { ref key, .. } if key == "RETRY_COUNT"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.forward.max_concurrent_requests = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConcurrency)));

        let max = usize::MAX.to_string();
        let mut config = Config::default();
        config
            .apply_overrides(env(&[("MAX_CONCURRENT_REQUESTS", max.as_str())]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyConcurrent { value, .. }) if value == usize::MAX
        ));

        let mut config = Config::default();
        config.forward.endpoint = "ftp://example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme { .. })
        ));

        let mut config = Config::default();
        config.forward.endpoint = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        let mut config = Config::default();
        config.recovery.supervisor_command.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptySupervisorCommand)
        ));

        let mut config = Config::default();
        config.watch.stability_poll_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration { field: "watch.stability_poll_ms" })
        ));
    }
}
