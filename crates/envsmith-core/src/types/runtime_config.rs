//! Runtime configuration types for operational parameters
//!
//! These types control network timeouts, retry policies, worker pool
//! sizes, detection caching and install behaviour.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Network and HTTP configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Retry policy configurations
    #[serde(default)]
    pub retry_policies: RetryPoliciesConfig,

    /// Worker pool sizes and channel capacity
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Detection strategy settings
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Installer settings
    #[serde(default)]
    pub install: InstallConfig,

    /// Directory overrides
    #[serde(default)]
    pub paths: PathsConfig,
}

impl RuntimeConfig {
    /// Retry policy for a named operation, falling back to the default
    pub fn retry_policy(&self, operation: &str) -> RetryPolicy {
        self.retry_policies
            .operations
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.retry_policies.default.clone())
    }
}

/// Network and HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-attempt download timeout in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Read buffer size used when hashing files
    #[serde(default = "default_chunk_size")]
    pub download_chunk_size: usize,

    /// User agent string for HTTP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            download_timeout_secs: default_download_timeout(),
            download_chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}
fn default_download_timeout() -> u64 {
    600 // 10 minutes
}
fn default_chunk_size() -> usize {
    1024 * 1024 // 1 MB
}
fn default_user_agent() -> String {
    format!(
        "envsmith/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Retry policy configurations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPoliciesConfig {
    /// Default retry policy
    #[serde(default)]
    pub default: RetryPolicy,

    /// Per-operation retry policies
    #[serde(default)]
    pub operations: HashMap<String, RetryPolicy>,
}

impl Default for RetryPoliciesConfig {
    fn default() -> Self {
        let mut operations = HashMap::new();

        operations.insert(
            "download".to_string(),
            RetryPolicy {
                max_attempts: 3,
                strategy: RetryStrategy::ExponentialBackoff,
                backoff_multiplier: 2.0,
                initial_delay_ms: 1000,
                max_delay_ms: 30000,
            },
        );

        Self {
            default: RetryPolicy::default(),
            operations,
        }
    }
}

/// Retry policy for an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry strategy
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Backoff multiplier for exponential strategies
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Initial delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: RetryStrategy::default(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}

/// Retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    /// No delay between attempts
    None,

    /// Fixed delay between retries
    FixedDelay,

    /// Exponential backoff (default)
    #[default]
    ExponentialBackoff,

    /// Linear backoff
    LinearBackoff,
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConcurrencyConfig {
    #[serde(default = "default_parallel_downloads")]
    pub max_parallel_downloads: usize,

    #[serde(default = "default_parallel_detections")]
    pub max_parallel_detections: usize,

    #[serde(default = "default_parallel_installs")]
    pub max_parallel_installs: usize,

    /// Capacity of the per-session event channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_parallel_downloads(),
            max_parallel_detections: default_parallel_detections(),
            max_parallel_installs: default_parallel_installs(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

fn default_parallel_downloads() -> usize {
    4
}
fn default_parallel_detections() -> usize {
    8
}
fn default_parallel_installs() -> usize {
    2
}
fn default_event_capacity() -> usize {
    256
}

/// Detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectionConfig {
    /// How long a detection report stays fresh
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Timeout for version and inventory subprocesses
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}
fn default_command_timeout() -> u64 {
    10
}

/// Installer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallConfig {
    /// Timeout for a single installer or script process
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Parent directory for component target directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_root: Option<Utf8PathBuf>,

    /// Shell profile that receives persisted `export` lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_profile: Option<Utf8PathBuf>,

    /// Refuse artifacts that declare no checksum
    #[serde(default)]
    pub require_checksums: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            install_root: None,
            env_profile: None,
            require_checksums: false,
        }
    }
}

fn default_step_timeout() -> u64 {
    1800 // 30 minutes
}

/// Directory overrides; unset values resolve under ~/.envsmith
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<Utf8PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<Utf8PathBuf>,

    /// Assets shipped with envsmith; never reported as a user install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<Utf8PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_download_policy() {
        let config = RuntimeConfig::default();
        let policy = config.retry_policy("download");
        assert_eq!(policy.strategy, RetryStrategy::ExponentialBackoff);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_unknown_operation_uses_default_policy() {
        let config = RuntimeConfig::default();
        assert_eq!(config.retry_policy("detect"), RetryPolicy::default());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
concurrency:
  max-parallel-downloads: 9
install:
  require-checksums: true
"#;
        let config: RuntimeConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.concurrency.max_parallel_downloads, 9);
        assert_eq!(config.concurrency.max_parallel_installs, 2);
        assert!(config.install.require_checksums);
        assert_eq!(config.detection.cache_ttl_secs, 300);
    }
}
