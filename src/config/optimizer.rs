//! # Adaptive Optimization Policy
//!
//! Derives retry and timeout tuning from observed execution history. The
//! mappings are fixed policy tables; what adapts is the input statistics,
//! accumulated per decomposer type.

use super::{ExecutionConfig, PerformanceThresholds};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Named tuning profile scaling a step's configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    #[default]
    Basic,
    Advanced,
    Aggressive,
}

impl OptimizationLevel {
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            Self::Basic => 1.2,
            Self::Advanced => 1.5,
            Self::Aggressive => 3.0,
        }
    }

    pub fn scaled_timeout(&self, base: Duration) -> Duration {
        base.mul_f64(self.timeout_multiplier())
    }
}

/// Latency bracket used for step grouping and optimization decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBracket {
    Fast,
    Medium,
    Slow,
}

impl ExecutionBracket {
    pub fn for_duration(elapsed: Duration, thresholds: &PerformanceThresholds) -> Self {
        let ms = elapsed.as_millis() as u64;
        if ms < thresholds.fast_ms {
            Self::Fast
        } else if ms < thresholds.medium_ms {
            Self::Medium
        } else {
            Self::Slow
        }
    }
}

/// Success rate (percent, 0..=100) to retry-attempt bucket.
pub fn retry_attempts_for_success_rate(success_rate: f64) -> u32 {
    if success_rate < 50.0 {
        5
    } else if success_rate < 80.0 {
        3
    } else if success_rate < 95.0 {
        2
    } else {
        1
    }
}

/// Observed execution statistics for one decomposer type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ObservedStats {
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl ObservedStats {
    pub fn samples(&self) -> u64 {
        self.successes + self.failures
    }

    /// Percent of successful attempts; 100 with no samples.
    pub fn success_rate(&self) -> f64 {
        let total = self.samples();
        if total == 0 {
            100.0
        } else {
            self.successes as f64 / total as f64 * 100.0
        }
    }

    pub fn mean_duration(&self) -> Duration {
        let total = self.samples();
        if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.total_duration_ms / total)
        }
    }
}

/// Retry policy derived from configuration plus observed history.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_execution_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay: config.retry_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Backoff delay before retry attempt `attempt` (1-based: the delay
    /// after the first failure is `base_delay`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .mul_f64(self.backoff_multiplier.powi(exponent as i32));
        let capped = raw.min(self.max_delay);
        if self.jitter {
            // +/- 25% keeps retrying workers from synchronizing
            capped.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        }
    }
}

/// Accumulates per-decomposer-type statistics and derives policy from them.
#[derive(Debug, Default)]
pub struct Optimizer {
    state: Mutex<HashMap<String, ObservedStats>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one step attempt outcome for `decomposer_type`.
    pub fn record_outcome(&self, decomposer_type: &str, success: bool, elapsed: Duration) {
        let mut state = self.state.lock();
        let stats = state.entry(decomposer_type.to_string()).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_duration_ms += elapsed.as_millis() as u64;
    }

    pub fn stats_for(&self, decomposer_type: &str) -> ObservedStats {
        self.state
            .lock()
            .get(decomposer_type)
            .copied()
            .unwrap_or_default()
    }

    /// Derive a retry policy: configured delays, attempt budget taken from
    /// the observed success-rate bucket once history exists.
    pub fn policy_for(&self, decomposer_type: &str, config: &ExecutionConfig) -> RetryPolicy {
        let mut policy = RetryPolicy::from_execution_config(config);
        let stats = self.stats_for(decomposer_type);
        if stats.samples() > 0 {
            policy.max_attempts = retry_attempts_for_success_rate(stats.success_rate());
        }
        policy
    }
}
