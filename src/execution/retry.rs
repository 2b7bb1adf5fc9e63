//! Run timing: source retry backoff and stage wait bounds

use crate::core::config::{PipelineSettings, SourceRetrySettings};
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SourceRetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay after the failed `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SourceRetrySettings::default())
    }
}

/// Everything that bounds how long one run may wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPolicy {
    pub source_retry: RetryPolicy,
    pub build_timeout: Duration,
    pub rollout_timeout: Duration,
    pub poll_interval: Duration,
}

impl RunPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            source_retry: RetryPolicy::from_settings(&settings.source_retry),
            build_timeout: Duration::from_secs(settings.build_timeout_secs),
            rollout_timeout: Duration::from_secs(settings.rollout_timeout_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}
