//! Hierarchical configuration loader with precedence
//!
//! Loads configuration from multiple sources with the following precedence (low to high):
//! 1. Embedded defaults (built into binary)
//! 2. User runtime config (~/.envsmith/runtime.yaml)
//! 3. Environment variables (ENVSMITH_* prefix)
//! 4. CLI flags (handled by caller)

use crate::error::{Error, Result};
use crate::types::{RetryPoliciesConfig, RuntimeConfig};
use camino::{Utf8Path, Utf8PathBuf};
use rust_embed::RustEmbed;
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::str::FromStr;

/// Embedded configuration files
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/../../embedded/config/"]
#[prefix = ""]
struct EmbeddedConfigs;

const RUNTIME_CONFIG_FILE: &str = "runtime.yaml";

/// Configuration hierarchy loader
pub struct HierarchicalConfigLoader {
    /// Base directory for configuration and state (~/.envsmith)
    config_dir: Utf8PathBuf,
}

/// Concrete directories derived from config and the base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub state_dir: Utf8PathBuf,
    pub scratch_dir: Utf8PathBuf,
    pub install_root: Utf8PathBuf,
}

impl ResolvedPaths {
    /// One JSON file per component
    pub fn status_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("status")
    }

    /// Transaction journals awaiting commit
    pub fn journal_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("transactions")
    }

    /// Append-only event history
    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.state_dir.join("events.jsonl")
    }
}

impl HierarchicalConfigLoader {
    /// Create a loader rooted at ~/.envsmith
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Ok(Self { config_dir })
    }

    /// Create a loader with a custom config directory
    pub fn with_dir(config_dir: Utf8PathBuf) -> Self {
        Self { config_dir }
    }

    /// Get the standard config directory (~/.envsmith)
    fn get_config_dir() -> Result<Utf8PathBuf> {
        let home = crate::utils::get_home_dir()
            .map_err(|_| Error::invalid_config("Could not determine home directory"))?;
        let home = Utf8PathBuf::from_path_buf(home)
            .map_err(|_| Error::invalid_config("Home directory is not valid UTF-8"))?;

        let config_dir = home.join(".envsmith");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }

        Ok(config_dir)
    }

    /// Load runtime configuration with hierarchical precedence
    pub fn load_runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = Self::load_embedded_config::<RuntimeConfig>("runtime-defaults.yaml")?;

        let runtime_config_path = self.config_dir.join(RUNTIME_CONFIG_FILE);
        if runtime_config_path.exists() {
            let file_config = self.load_yaml_file::<RuntimeConfig>(&runtime_config_path)?;
            config = Self::merge_runtime_config(config, file_config);
        }

        Self::apply_env_overrides(&mut config)?;

        Ok(config)
    }

    /// Resolve state, scratch and install directories
    pub fn resolve_paths(&self, config: &RuntimeConfig) -> ResolvedPaths {
        let state_dir = config
            .paths
            .state_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("state"));
        let scratch_dir = config
            .paths
            .scratch_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("downloads"));
        let install_root = config
            .install
            .install_root
            .clone()
            .unwrap_or_else(|| self.config_dir.join("tools"));

        ResolvedPaths {
            state_dir,
            scratch_dir,
            install_root,
        }
    }

    /// Load an embedded configuration file
    fn load_embedded_config<T: DeserializeOwned>(filename: &str) -> Result<T> {
        let embedded_file = EmbeddedConfigs::get(filename).ok_or_else(|| {
            Error::config_not_found(format!("Embedded config not found: {}", filename))
        })?;

        let content = std::str::from_utf8(&embedded_file.data).map_err(|_| {
            Error::invalid_config(format!("Invalid UTF-8 in embedded config: {}", filename))
        })?;

        serde_yaml_ng::from_str(content).map_err(|e| {
            Error::invalid_config(format!(
                "Failed to parse embedded config {}: {}",
                filename, e
            ))
        })
    }

    /// Load a YAML file and parse it
    fn load_yaml_file<T: DeserializeOwned>(&self, path: &Utf8Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse {}: {}", path, e)))
    }

    /// Merge two runtime configs (base is overridden by overlay)
    fn merge_runtime_config(base: RuntimeConfig, overlay: RuntimeConfig) -> RuntimeConfig {
        RuntimeConfig {
            network: overlay.network,
            retry_policies: Self::merge_retry_policies(base.retry_policies, overlay.retry_policies),
            concurrency: overlay.concurrency,
            detection: overlay.detection,
            install: overlay.install,
            paths: crate::types::PathsConfig {
                state_dir: overlay.paths.state_dir.or(base.paths.state_dir),
                scratch_dir: overlay.paths.scratch_dir.or(base.paths.scratch_dir),
                bundle_dir: overlay.paths.bundle_dir.or(base.paths.bundle_dir),
            },
        }
    }

    /// Merge retry policies; per-operation entries accumulate
    fn merge_retry_policies(
        mut base: RetryPoliciesConfig,
        overlay: RetryPoliciesConfig,
    ) -> RetryPoliciesConfig {
        for (key, policy) in overlay.operations {
            base.operations.insert(key, policy);
        }
        base.default = overlay.default;
        base
    }

    /// Apply environment variable overrides to runtime config
    fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
        if let Some(val) = env_number("ENVSMITH_CONNECT_TIMEOUT_SECS")? {
            config.network.connect_timeout_secs = val;
        }
        if let Some(val) = env_number("ENVSMITH_DOWNLOAD_TIMEOUT_SECS")? {
            config.network.download_timeout_secs = val;
        }
        if let Some(val) = env_number("ENVSMITH_MAX_PARALLEL_DOWNLOADS")? {
            config.concurrency.max_parallel_downloads = val;
        }
        if let Some(val) = env_number("ENVSMITH_MAX_PARALLEL_INSTALLS")? {
            config.concurrency.max_parallel_installs = val;
        }
        if let Some(val) = env_number("ENVSMITH_DETECTION_CACHE_TTL_SECS")? {
            config.detection.cache_ttl_secs = val;
        }
        if let Some(val) = env_number("ENVSMITH_STEP_TIMEOUT_SECS")? {
            config.install.step_timeout_secs = val;
        }

        if let Ok(val) = env::var("ENVSMITH_REQUIRE_CHECKSUMS") {
            config.install.require_checksums = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("ENVSMITH_STATE_DIR") {
            config.paths.state_dir = Some(Utf8PathBuf::from(val));
        }
        if let Ok(val) = env::var("ENVSMITH_SCRATCH_DIR") {
            config.paths.scratch_dir = Some(Utf8PathBuf::from(val));
        }
        if let Ok(val) = env::var("ENVSMITH_BUNDLE_DIR") {
            config.paths.bundle_dir = Some(Utf8PathBuf::from(val));
        }
        if let Ok(val) = env::var("ENVSMITH_INSTALL_ROOT") {
            config.install.install_root = Some(Utf8PathBuf::from(val));
        }

        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_config(format!("{} must be a valid number", name))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn create_temp_loader() -> (HierarchicalConfigLoader, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_dir =
            Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).expect("Invalid UTF-8 path");
        let loader = HierarchicalConfigLoader::with_dir(config_dir);
        (loader, temp_dir)
    }

    #[test]
    #[serial]
    fn test_load_runtime_config_defaults() {
        let (loader, _temp) = create_temp_loader();
        let config = loader.load_runtime_config().unwrap();
        assert_eq!(config.network.download_timeout_secs, 600);
        assert_eq!(config.concurrency.max_parallel_downloads, 4);
        assert!(!config.install.require_checksums);
    }

    #[test]
    #[serial]
    fn test_load_runtime_config_from_file() {
        let (loader, _temp) = create_temp_loader();

        let config_content = r#"
network:
  download-timeout-secs: 900
concurrency:
  max-parallel-installs: 6
retry-policies:
  operations:
    detect:
      max-attempts: 1
"#;
        let config_path = loader.config_dir().join(RUNTIME_CONFIG_FILE);
        fs::write(&config_path, config_content).unwrap();

        let config = loader.load_runtime_config().unwrap();
        assert_eq!(config.network.download_timeout_secs, 900);
        assert_eq!(config.concurrency.max_parallel_installs, 6);
        // Embedded per-operation policies survive the merge
        assert!(config.retry_policies.operations.contains_key("download"));
        assert_eq!(config.retry_policy("detect").max_attempts, 1);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let (loader, _temp) = create_temp_loader();

        env::set_var("ENVSMITH_DOWNLOAD_TIMEOUT_SECS", "42");
        env::set_var("ENVSMITH_MAX_PARALLEL_DOWNLOADS", "1");
        env::set_var("ENVSMITH_REQUIRE_CHECKSUMS", "true");
        env::set_var("ENVSMITH_STATE_DIR", "/tmp/envsmith-state");
        env::set_var("ENVSMITH_BUNDLE_DIR", "/opt/envsmith/bundle");

        let config = loader.load_runtime_config().unwrap();
        assert_eq!(config.network.download_timeout_secs, 42);
        assert_eq!(config.concurrency.max_parallel_downloads, 1);
        assert!(config.install.require_checksums);
        assert_eq!(
            config.paths.state_dir,
            Some(Utf8PathBuf::from("/tmp/envsmith-state"))
        );
        assert_eq!(
            config.paths.bundle_dir,
            Some(Utf8PathBuf::from("/opt/envsmith/bundle"))
        );

        env::remove_var("ENVSMITH_DOWNLOAD_TIMEOUT_SECS");
        env::remove_var("ENVSMITH_MAX_PARALLEL_DOWNLOADS");
        env::remove_var("ENVSMITH_REQUIRE_CHECKSUMS");
        env::remove_var("ENVSMITH_STATE_DIR");
        env::remove_var("ENVSMITH_BUNDLE_DIR");
    }

    #[test]
    #[serial]
    fn test_invalid_env_number_is_rejected() {
        let (loader, _temp) = create_temp_loader();
        env::set_var("ENVSMITH_STEP_TIMEOUT_SECS", "soon");

        let result = loader.load_runtime_config();
        env::remove_var("ENVSMITH_STEP_TIMEOUT_SECS");

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_resolve_paths_defaults_under_config_dir() {
        let (loader, _temp) = create_temp_loader();
        let paths = loader.resolve_paths(&RuntimeConfig::default());

        assert_eq!(paths.state_dir, loader.config_dir().join("state"));
        assert_eq!(paths.scratch_dir, loader.config_dir().join("downloads"));
        assert_eq!(paths.install_root, loader.config_dir().join("tools"));
        assert_eq!(paths.status_dir(), paths.state_dir.join("status"));
    }

    #[test]
    fn test_merge_keeps_base_paths_when_overlay_unset() {
        let mut base = RuntimeConfig::default();
        base.paths.state_dir = Some(Utf8PathBuf::from("/base/state"));
        let mut overlay = RuntimeConfig::default();
        overlay.paths.scratch_dir = Some(Utf8PathBuf::from("/overlay/scratch"));

        let merged = HierarchicalConfigLoader::merge_runtime_config(base, overlay);
        assert_eq!(merged.paths.state_dir, Some(Utf8PathBuf::from("/base/state")));
        assert_eq!(
            merged.paths.scratch_dir,
            Some(Utf8PathBuf::from("/overlay/scratch"))
        );
    }
}
