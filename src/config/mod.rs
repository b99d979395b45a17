//! # Engine Configuration
//!
//! An explicit, immutable configuration object built once at service start
//! and passed by reference into every consumer. There is no ambient global
//! lookup; per-call variation happens through [`ConfigOverrides`], which
//! covers a deliberately narrow set of top-level keys.
//!
//! ## Usage
//!
//! ```rust
//! use taskweave_core::config::{ConfigOverrides, EngineConfig};
//!
//! let config = EngineConfig::default();
//! config.validate().expect("defaults are valid");
//!
//! let exec = config.execution_config(&ConfigOverrides {
//!     max_parallel: Some(2),
//!     ..Default::default()
//! });
//! assert_eq!(exec.max_parallel, 2);
//! ```

pub mod error;
pub mod loader;
pub mod optimizer;

use crate::constants::{defaults, WAKE_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;
pub use optimizer::{
    ExecutionBracket, ObservedStats, OptimizationLevel, Optimizer, RetryPolicy,
};

/// Root configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum dependency-chain length a decomposition may produce
    pub max_depth: u32,

    /// Overall workflow deadline in seconds
    pub timeout_seconds: u64,

    /// Maximum concurrently in-flight steps per run
    pub max_parallel: u32,

    /// Retry attempts after a failed step attempt
    pub retry_attempts: u32,

    /// Per-decomposer-type overrides keyed by decomposer name
    pub decomposers: HashMap<String, DecomposerOverrides>,

    /// Task execution settings
    pub execution: ExecutionSettings,

    /// Adaptive optimization settings
    pub optimization: OptimizationSettings,

    /// Wake-channel notification settings
    pub notifications: NotificationSettings,

    /// Feature gates
    pub features: FeatureFlags,

    /// Latency bracket boundaries
    pub performance_thresholds: PerformanceThresholds,

    /// Database connection and pooling
    pub database: DatabaseSettings,

    /// Durable queue tuning
    pub queues: QueueSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: defaults::MAX_DEPTH,
            timeout_seconds: defaults::TIMEOUT_SECONDS,
            max_parallel: defaults::MAX_PARALLEL,
            retry_attempts: defaults::RETRY_ATTEMPTS,
            decomposers: HashMap::new(),
            execution: ExecutionSettings::default(),
            optimization: OptimizationSettings::default(),
            notifications: NotificationSettings::default(),
            features: FeatureFlags::default(),
            performance_thresholds: PerformanceThresholds::default(),
            database: DatabaseSettings::default(),
            queues: QueueSettings::default(),
        }
    }
}

/// Per-decomposer-type overrides of the decomposition bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerOverrides {
    pub max_depth: Option<u32>,
    pub parallel_threshold: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub retry_attempts: Option<u32>,
}

/// Task execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Per-attempt step timeout in seconds
    pub task_timeout_seconds: u64,
    /// Overrides the top-level `max_parallel` when set
    pub max_parallel: Option<u32>,
    /// Base delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Exponential backoff multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Randomize backoff delays to avoid thundering herds
    pub jitter: bool,
    /// Result-polling interval in milliseconds (correctness fallback
    /// when no wake notification arrives)
    pub poll_interval_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            task_timeout_seconds: defaults::TASK_TIMEOUT_SECONDS,
            max_parallel: None,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter: true,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

/// Adaptive optimization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Master switch; requires `features.optimization` (validated)
    pub enabled: bool,
    /// Named tuning profile scaling step timeouts
    pub level: OptimizationLevel,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: OptimizationLevel::Basic,
        }
    }
}

/// Wake-channel notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    /// LISTEN/NOTIFY channel name
    pub wake_channel: String,
    /// Minimum interval between wake notifications per queue
    pub wake_debounce_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            wake_channel: WAKE_CHANNEL.to_string(),
            wake_debounce_ms: 10,
        }
    }
}

/// Feature gates. Unknown feature names resolve to disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub monitoring: bool,
    pub optimization: bool,
    pub notifications: bool,
    pub learning: bool,
    pub real_time: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            monitoring: true,
            optimization: false,
            notifications: true,
            learning: false,
            real_time: true,
        }
    }
}

/// Latency bracket boundaries used for step grouping decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub fast_ms: u64,
    pub medium_ms: u64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            fast_ms: 1_000,
            medium_ms: 10_000,
        }
    }
}

/// Database connection and pooling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool: u32,
    pub checkout_timeout_seconds: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool: 5,
            checkout_timeout_seconds: 10,
        }
    }
}

/// Durable queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Message lease (visibility timeout) in seconds
    pub visibility_timeout_seconds: u64,
    pub batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: defaults::LEASE_SECONDS,
            batch_size: defaults::QUEUE_BATCH_SIZE,
        }
    }
}

/// Per-call overrides. Only this narrow set of top-level keys may be
/// overridden at a call site; everything else is fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_depth: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub max_parallel: Option<u32>,
    pub retry_attempts: Option<u32>,
}

/// Decomposition bounds resolved for one decomposer type.
#[derive(Debug, Clone, PartialEq)]
pub struct DecomposerConfig {
    pub max_depth: u32,
    pub parallel_threshold: u32,
    pub timeout: Duration,
    pub retry_attempts: u32,
}

/// Execution settings resolved for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub max_parallel: u32,
    pub task_timeout: Duration,
    pub workflow_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub poll_interval: Duration,
}

impl EngineConfig {
    /// Resolve a dotted path against the tree, with the narrow top-level
    /// override set applied first. Returns `None` for unknown paths.
    pub fn get(&self, path: &str, overrides: &ConfigOverrides) -> Option<serde_json::Value> {
        let mut tree = serde_json::to_value(self).ok()?;
        if let serde_json::Value::Object(map) = &mut tree {
            if let Some(v) = overrides.max_depth {
                map.insert("max_depth".into(), v.into());
            }
            if let Some(v) = overrides.timeout_seconds {
                map.insert("timeout_seconds".into(), v.into());
            }
            if let Some(v) = overrides.max_parallel {
                map.insert("max_parallel".into(), v.into());
            }
            if let Some(v) = overrides.retry_attempts {
                map.insert("retry_attempts".into(), v.into());
            }
        }
        path.split('.')
            .try_fold(tree, |node, key| node.get(key).cloned())
    }

    /// Decomposition bounds for `decomposer_type`: static defaults, then the
    /// per-type subtree, then per-call overrides, shallow-merged in order.
    pub fn decomposer_config(
        &self,
        decomposer_type: &str,
        overrides: &ConfigOverrides,
    ) -> DecomposerConfig {
        let per_type = self.decomposers.get(decomposer_type);

        let max_depth = overrides
            .max_depth
            .or_else(|| per_type.and_then(|t| t.max_depth))
            .unwrap_or(self.max_depth);
        let parallel_threshold = per_type
            .and_then(|t| t.parallel_threshold)
            .unwrap_or(defaults::PARALLEL_THRESHOLD);
        let timeout_seconds = overrides
            .timeout_seconds
            .or_else(|| per_type.and_then(|t| t.timeout_seconds))
            .unwrap_or(self.timeout_seconds);
        let retry_attempts = overrides
            .retry_attempts
            .or_else(|| per_type.and_then(|t| t.retry_attempts))
            .unwrap_or(self.retry_attempts);

        DecomposerConfig {
            max_depth,
            parallel_threshold,
            timeout: Duration::from_secs(timeout_seconds),
            retry_attempts,
        }
    }

    /// Execution settings with per-call overrides shallow-merged in.
    pub fn execution_config(&self, overrides: &ConfigOverrides) -> ExecutionConfig {
        ExecutionConfig {
            max_parallel: overrides
                .max_parallel
                .or(self.execution.max_parallel)
                .unwrap_or(self.max_parallel),
            task_timeout: Duration::from_secs(self.execution.task_timeout_seconds),
            workflow_timeout: Duration::from_secs(
                overrides.timeout_seconds.unwrap_or(self.timeout_seconds),
            ),
            retry_attempts: overrides.retry_attempts.unwrap_or(self.retry_attempts),
            retry_delay: Duration::from_millis(self.execution.retry_delay_ms),
            backoff_multiplier: self.execution.backoff_multiplier,
            jitter: self.execution.jitter,
            poll_interval: Duration::from_millis(self.execution.poll_interval_ms),
        }
    }

    pub fn optimization_config(&self) -> &OptimizationSettings {
        &self.optimization
    }

    pub fn notification_config(&self) -> &NotificationSettings {
        &self.notifications
    }

    /// Feature gate lookup. Unrecognized names return false (fail-closed).
    pub fn feature_enabled(&self, name: &str) -> bool {
        match name {
            "monitoring" => self.features.monitoring,
            "optimization" => self.features.optimization,
            "notifications" => self.features.notifications,
            "learning" => self.features.learning,
            "real_time" => self.features.real_time,
            _ => false,
        }
    }

    /// Whether the adaptive optimizer should run.
    pub fn optimization_active(&self) -> bool {
        self.optimization.enabled && self.features.optimization
    }

    /// Validate ranges and cross-field consistency. Violations come back as
    /// descriptive errors; the caller decides whether to proceed.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=19).contains(&self.max_depth) {
            return Err(ConfigurationError::out_of_range(
                "max_depth",
                i64::from(self.max_depth),
                1,
                19,
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigurationError::out_of_range(
                "timeout_seconds",
                0,
                1,
                i64::MAX,
            ));
        }
        if !(1..=99).contains(&self.max_parallel) {
            return Err(ConfigurationError::out_of_range(
                "max_parallel",
                i64::from(self.max_parallel),
                1,
                99,
            ));
        }
        if self.retry_attempts > 9 {
            return Err(ConfigurationError::out_of_range(
                "retry_attempts",
                i64::from(self.retry_attempts),
                0,
                9,
            ));
        }
        for (name, t) in &self.decomposers {
            if let Some(depth) = t.max_depth {
                if !(1..=19).contains(&depth) {
                    return Err(ConfigurationError::out_of_range(
                        format!("decomposers.{name}.max_depth"),
                        i64::from(depth),
                        1,
                        19,
                    ));
                }
            }
            if let Some(attempts) = t.retry_attempts {
                if attempts > 9 {
                    return Err(ConfigurationError::out_of_range(
                        format!("decomposers.{name}.retry_attempts"),
                        i64::from(attempts),
                        0,
                        9,
                    ));
                }
            }
        }
        if self.optimization.enabled && !self.features.optimization {
            return Err(ConfigurationError::inconsistent(
                "optimization.enabled requires features.optimization",
            ));
        }
        if self.database.pool == 0 {
            return Err(ConfigurationError::out_of_range("database.pool", 0, 1, 9999));
        }
        Ok(())
    }
}
