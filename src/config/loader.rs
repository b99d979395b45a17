//! # Configuration Loading
//!
//! YAML-driven configuration with per-environment overlays. The loaded
//! tree is validated before it is handed out; there are no silent
//! fallbacks for malformed files.
//!
//! Layout of a configuration file:
//!
//! ```yaml
//! max_depth: 8
//! execution:
//!   task_timeout_seconds: 20
//! environments:
//!   production:
//!     execution:
//!       task_timeout_seconds: 60
//! ```
//!
//! The overlay matching the current environment (from `TASKWEAVE_ENV`,
//! default `development`) is deep-merged over the base document.
//! `DATABASE_URL` overrides `database.url` when set.

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const ENV_CONFIG_PATH: &str = "TASKWEAVE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/taskweave.yaml";

/// Loads and owns the immutable engine configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<EngineConfig>,
    environment: String,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration for the detected environment.
    ///
    /// Resolution order: explicit `TASKWEAVE_CONFIG` path, then
    /// `config/taskweave.yaml` if present, then built-in defaults.
    pub fn load() -> ConfigResult<Self> {
        let environment = detect_environment();
        if let Ok(path) = env::var(ENV_CONFIG_PATH) {
            return Self::load_from_file(Path::new(&path), &environment);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load_from_file(default_path, &environment);
        }

        debug!(environment = %environment, "no configuration file; using defaults");
        let mut config = EngineConfig::default();
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            environment,
            source: None,
        })
    }

    /// Load configuration from an explicit file path.
    pub fn load_from_file(path: &Path, environment: &str) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut config = Self::parse(&raw, environment)?;
        apply_env_overrides(&mut config);
        config.validate()?;

        debug!(
            environment = %environment,
            path = %path.display(),
            "configuration loaded"
        );
        Ok(Self {
            config: Arc::new(config),
            environment: environment.to_string(),
            source: Some(path.to_path_buf()),
        })
    }

    /// Parse a YAML document and apply the overlay for `environment`.
    pub fn parse(raw: &str, environment: &str) -> ConfigResult<EngineConfig> {
        let mut document: YamlValue =
            serde_yaml::from_str(raw).map_err(|e| ConfigurationError::Parse {
                message: e.to_string(),
            })?;

        if let YamlValue::Mapping(map) = &mut document {
            let overlays = map.remove(&YamlValue::String("environments".to_string()));
            if let Some(YamlValue::Mapping(envs)) = overlays {
                let env_key = YamlValue::String(environment.to_string());
                if let Some(overlay) = envs.get(&env_key) {
                    deep_merge(&mut document, overlay.clone());
                }
            }
        }

        serde_yaml::from_value(document).map_err(|e| ConfigurationError::Parse {
            message: e.to_string(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_arc(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn detect_environment() -> String {
    env::var("TASKWEAVE_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn apply_env_overrides(config: &mut EngineConfig) {
    if let Ok(url) = env::var("DATABASE_URL") {
        config.database.url = url;
    }
}

/// Merge `overlay` into `base`: mappings merge key-wise, everything else
/// replaces.
fn deep_merge(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
max_depth: 8
max_parallel: 6
execution:
  task_timeout_seconds: 20
  retry_delay_ms: 250
features:
  optimization: true
optimization:
  enabled: true
  level: advanced
environments:
  production:
    max_parallel: 12
    execution:
      task_timeout_seconds: 60
"#;

    #[test]
    fn test_parse_base_document() {
        let config = ConfigManager::parse(SAMPLE, "development").unwrap();
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.max_parallel, 6);
        assert_eq!(config.execution.task_timeout_seconds, 20);
        assert_eq!(config.execution.retry_delay_ms, 250);
        assert!(config.optimization_active());
        assert_eq!(
            config.optimization.level,
            crate::config::OptimizationLevel::Advanced
        );
    }

    #[test]
    fn test_environment_overlay_deep_merges() {
        let config = ConfigManager::parse(SAMPLE, "production").unwrap();
        assert_eq!(config.max_parallel, 12);
        assert_eq!(config.execution.task_timeout_seconds, 60);
        // Untouched by the overlay, survives the merge
        assert_eq!(config.execution.retry_delay_ms, 250);
        assert_eq!(config.max_depth, 8);
    }

    #[test]
    fn test_unknown_environment_uses_base() {
        let config = ConfigManager::parse(SAMPLE, "staging").unwrap();
        assert_eq!(config.max_parallel, 6);
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let err = ConfigManager::parse(": not yaml :", "development").unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_depth: 25").unwrap();
        let err = ConfigManager::load_from_file(file.path(), "development").unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { .. }));
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{SAMPLE}").unwrap();
        let manager = ConfigManager::load_from_file(file.path(), "production").unwrap();
        assert_eq!(manager.environment(), "production");
        assert_eq!(manager.config().max_parallel, 12);
        assert!(manager.source().is_some());
    }
}
