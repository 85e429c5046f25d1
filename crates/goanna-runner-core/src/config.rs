use crate::error::RunnerError;
use crate::output::{CrashSignatures, DEFAULT_CRASH_SIGNATURES};
use crate::profile::ProfileOptions;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Bounds for every suspension point of the runner lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// How long `start()` waits for the process to become responsive (in milliseconds)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Delay between liveness probes while starting (in milliseconds)
    #[serde(default = "default_startup_probe_interval_ms")]
    pub startup_probe_interval_ms: u64,

    /// How long a graceful stop may take before escalating (in milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Delay between background liveness checks (in milliseconds)
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            startup_probe_interval_ms: default_startup_probe_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.startup_timeout_ms == 0 {
            return Err(anyhow::anyhow!("startup_timeout_ms must be greater than zero"));
        }
        if self.startup_probe_interval_ms == 0 || self.monitor_interval_ms == 0 {
            return Err(anyhow::anyhow!("probe and monitor intervals must be greater than zero"));
        }
        if self.startup_probe_interval_ms > self.startup_timeout_ms {
            return Err(anyhow::anyhow!(
                "startup_probe_interval_ms cannot be greater than startup_timeout_ms"
            ));
        }
        if self.startup_timeout_ms > 3_600_000 {
            return Err(anyhow::anyhow!("startup_timeout_ms should not exceed 1 hour"));
        }
        if self.grace_period_ms > 600_000 {
            return Err(anyhow::anyhow!("grace_period_ms should not exceed 10 minutes"));
        }
        if self.monitor_interval_ms > 60_000 {
            return Err(anyhow::anyhow!("monitor_interval_ms should not exceed 60 seconds"));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_probe_interval(&self) -> Duration {
        Duration::from_millis(self.startup_probe_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Retry policy for device channel commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Minimum delay between retry attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between retry attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Jitter factor for randomizing delays (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// One attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 0,
            jitter_factor: 0.0,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!(
                "min_delay_ms cannot be greater than max_delay_ms"
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("jitter_factor must be between 0.0 and 1.0"));
        }

        if self.max_attempts > 10 {
            return Err(anyhow::anyhow!(
                "max_attempts should not exceed 10 to avoid excessive retries"
            ));
        }

        if self.max_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("max_delay_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

/// Where and what to launch on an attached device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    /// Path to the `adb` executable
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,

    /// Device serial; the only attached device is used when unset
    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default = "default_package")]
    pub package: String,

    #[serde(default = "default_activity")]
    pub activity: Option<String>,

    #[serde(default = "default_intent_action")]
    pub intent_action: Option<String>,

    /// URL handed to the launch intent
    #[serde(default)]
    pub url: Option<String>,

    /// Directory on the device the profile is pushed under
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Package archive the mobile-app runner installs before each run
    #[serde(default)]
    pub archive: Option<PathBuf>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            serial: None,
            package: default_package(),
            activity: default_activity(),
            intent_action: default_intent_action(),
            url: None,
            remote_root: default_remote_root(),
            archive: None,
        }
    }
}

/// Main runner configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct RunnerConfig {
    /// Label used in logs
    #[builder(default)]
    pub name: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    pub profile: ProfileOptions,
    #[builder(default)]
    pub timeouts: TimeoutConfig,
    #[builder(default)]
    pub device: DeviceOptions,
    #[builder(default)]
    pub retry_config: RetryConfig,
    /// Output line that must appear before the process counts as started
    #[builder(default)]
    pub ready_pattern: Option<String>,
    #[builder(default = "default_crash_signatures()")]
    #[builder(setter(custom))]
    pub crash_signatures: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            profile: ProfileOptions::default(),
            timeouts: TimeoutConfig::default(),
            device: DeviceOptions::default(),
            retry_config: RetryConfig::default(),
            ready_pattern: None,
            crash_signatures: default_crash_signatures(),
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        self.timeouts
            .validate()
            .map_err(|e| RunnerError::ConfigurationError(format!("Invalid timeouts: {e}")))?;
        self.retry_config
            .validate()
            .map_err(|e| RunnerError::ConfigurationError(format!("Invalid retry config: {e}")))?;
        self.compile_crash_signatures()?;
        self.compile_ready_pattern()?;
        Ok(())
    }

    pub fn compile_crash_signatures(&self) -> Result<CrashSignatures, RunnerError> {
        CrashSignatures::new(&self.crash_signatures)
            .map_err(|e| RunnerError::ConfigurationError(format!("Invalid crash signature: {e}")))
    }

    pub fn compile_ready_pattern(&self) -> Result<Option<regex::Regex>, RunnerError> {
        self.ready_pattern
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| RunnerError::ConfigurationError(format!("Invalid ready pattern: {e}")))
    }
}

impl RunnerConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn crash_signatures<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.crash_signatures = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }
}

// Default value functions for serde
fn default_startup_timeout_ms() -> u64 {
    60_000
}
fn default_startup_probe_interval_ms() -> u64 {
    250
}
fn default_grace_period_ms() -> u64 {
    10_000
}
fn default_monitor_interval_ms() -> u64 {
    500
}
fn default_min_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitter_factor() -> f64 {
    0.1
}
fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}
fn default_package() -> String {
    "org.mozilla.fennec".to_string()
}
fn default_activity() -> Option<String> {
    Some("org.mozilla.gecko.BrowserApp".to_string())
}
fn default_intent_action() -> Option<String> {
    Some("android.intent.action.VIEW".to_string())
}
fn default_remote_root() -> String {
    "/data/local/tmp".to_string()
}
fn default_crash_signatures() -> Vec<String> {
    DEFAULT_CRASH_SIGNATURES.iter().map(|s| s.to_string()).collect()
}
