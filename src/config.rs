//! Configuration types for release-miner

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Transfer behavior configuration (destination directory, concurrency, HTTP client)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Directory downloaded assets are placed in (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Size of the global transfer permit pool (default: 2)
    ///
    /// This is the only limit on simultaneous active transfers; the dispatcher
    /// starts every transfer at once and lets the pool throttle them.
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// TCP connect timeout for the HTTP client (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Retry configuration for transient transfer failures
///
/// The defaults describe a fixed delay with no retry cap: a transfer that keeps
/// failing with a connection reset is re-issued indefinitely. Set `max_retries`
/// to bound it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries per asset, not counting the first fetch (default: None = unlimited)
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Delay before the first retry (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 1.0 = fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Scratch directory configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Parent directory for per-run scratch roots (default: "<system temp>/release-miner")
    #[serde(default = "default_scratch_root")]
    pub root: PathBuf,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: default_scratch_root(),
        }
    }
}

/// External tool paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to 7z executable (auto-detected if None)
    #[serde(default)]
    pub sevenzip_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            sevenzip_path: None,
            search_path: true,
        }
    }
}

/// Dispatch loop tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long an aborting run waits for tasks to unwind cooperatively
    /// before aborting them outright (default: 30 seconds)
    #[serde(default = "default_abort_grace", with = "duration_serde")]
    pub abort_grace: Duration,

    /// Capacity of the event broadcast channel (default: 1000)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            abort_grace: default_abort_grace(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Main configuration for the mining engine
///
/// Fields are organized into logical sub-configs:
/// - [`transfer`](TransferConfig) - download directory, permit pool, HTTP client
/// - [`retry`](RetryConfig) - transient failure handling
/// - [`scratch`](ScratchConfig) - per-run temporary directories
/// - [`tools`](ToolsConfig) - external archive tool discovery
/// - [`dispatch`](DispatchConfig) - unwind grace period and event buffering
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry settings for transient transfer failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Scratch directory settings
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// External tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Dispatch loop settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.transfer.download_dir
    }

    /// Check settings that would make the engine misbehave rather than fail loudly
    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_concurrent_transfers == 0 {
            return Err(Error::Config {
                message: "at least one transfer slot is required".to_string(),
                key: Some("transfer.max_concurrent_transfers".to_string()),
            });
        }
        if self.dispatch.event_capacity == 0 {
            return Err(Error::Config {
                message: "event channel capacity must be positive".to_string(),
                key: Some("dispatch.event_capacity".to_string()),
            });
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(Error::Config {
                message: format!(
                    "backoff multiplier must be at least 1.0, got {}",
                    multiplier
                ),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent_transfers() -> usize {
    2
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("release-miner/{}", env!("CARGO_PKG_VERSION"))
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("release-miner")
}

fn default_true() -> bool {
    true
}

fn default_abort_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    1000
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
