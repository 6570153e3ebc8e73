//! Engine configuration.
//!
//! Built through a validating builder so an [`EngineConfig`] in hand is
//! always internally consistent: concurrency limits are at least one,
//! the dedup window and dispatch timeout are non-zero, and the retry
//! policy has at least one attempt. The orchestrator holds the config
//! behind a swap point, so a reload replaces the whole value atomically
//! and applies to subsequent admissions without touching in-flight work.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::RetryPolicy;

/// Default per-repository concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
/// Default deduplication window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);
/// Default per-attempt dispatch timeout.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineConfigError {
    /// A concurrency limit of zero would deadlock every repository it
    /// applies to.
    #[error("max concurrency must be at least 1 (got 0 for {scope})")]
    ZeroConcurrency {
        /// `"default"` or the repository the override targets.
        scope: String,
    },
    /// A zero window disables deduplication silently; disable it
    /// explicitly instead.
    #[error("dedup window must be non-zero")]
    ZeroDedupWindow,
    /// A zero timeout would fail every dispatch attempt immediately.
    #[error("dispatch timeout must be non-zero")]
    ZeroDispatchTimeout,
    /// A retry policy with zero attempts can never dispatch.
    #[error("retry policy must allow at least 1 attempt")]
    ZeroRetryAttempts,
}

/// Validated engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    default_max_concurrency: usize,
    per_repo_max_concurrency: HashMap<String, usize>,
    dedup_window: Duration,
    dispatch_timeout: Duration,
    retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: DEFAULT_MAX_CONCURRENCY,
            per_repo_max_concurrency: HashMap::new(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Starts a builder with defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Concurrency ceiling for a repository: the per-repository override
    /// when present, the default otherwise.
    #[must_use]
    pub fn max_concurrency_for(&self, repository: &str) -> usize {
        self.per_repo_max_concurrency
            .get(repository)
            .copied()
            .unwrap_or(self.default_max_concurrency)
    }

    /// Deduplication window.
    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Per-attempt dispatch timeout.
    #[must_use]
    pub const fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// Dispatch retry policy.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Builder for [`EngineConfig`]. Invalid values surface at
/// [`build`](Self::build), not at set time.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigBuilder {
    default_max_concurrency: Option<usize>,
    per_repo_max_concurrency: HashMap<String, usize>,
    dedup_window_secs: Option<u64>,
    dispatch_timeout_secs: Option<u64>,
    max_dispatch_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

impl EngineConfigBuilder {
    /// Sets the default per-repository concurrency ceiling.
    #[must_use]
    pub fn default_max_concurrency(mut self, limit: usize) -> Self {
        self.default_max_concurrency = Some(limit);
        self
    }

    /// Adds a per-repository concurrency override.
    #[must_use]
    pub fn repo_max_concurrency(mut self, repository: impl Into<String>, limit: usize) -> Self {
        self.per_repo_max_concurrency.insert(repository.into(), limit);
        self
    }

    /// Sets the deduplication window.
    #[must_use]
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window_secs = Some(window.as_secs());
        self
    }

    /// Sets the per-attempt dispatch timeout.
    #[must_use]
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Sets the total dispatch attempts (including the first).
    #[must_use]
    pub fn max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = Some(attempts);
        self
    }

    /// Sets the base retry backoff.
    #[must_use]
    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff_ms = Some(base.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// Validates and produces the config.
    ///
    /// # Errors
    ///
    /// Returns [`EngineConfigError`] for any zero limit, window,
    /// timeout, or attempt count.
    pub fn build(self) -> Result<EngineConfig, EngineConfigError> {
        let default_max_concurrency =
            self.default_max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if default_max_concurrency == 0 {
            return Err(EngineConfigError::ZeroConcurrency {
                scope: "default".to_string(),
            });
        }
        for (repository, limit) in &self.per_repo_max_concurrency {
            if *limit == 0 {
                return Err(EngineConfigError::ZeroConcurrency {
                    scope: repository.clone(),
                });
            }
        }

        let dedup_window = self
            .dedup_window_secs
            .map_or(DEFAULT_DEDUP_WINDOW, Duration::from_secs);
        if dedup_window.is_zero() {
            return Err(EngineConfigError::ZeroDedupWindow);
        }

        let dispatch_timeout = self
            .dispatch_timeout_secs
            .map_or(DEFAULT_DISPATCH_TIMEOUT, Duration::from_secs);
        if dispatch_timeout.is_zero() {
            return Err(EngineConfigError::ZeroDispatchTimeout);
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: self.max_dispatch_attempts.unwrap_or(defaults.max_attempts),
            backoff_base: self
                .retry_backoff_ms
                .map_or(defaults.backoff_base, Duration::from_millis),
        };
        if retry.max_attempts == 0 {
            return Err(EngineConfigError::ZeroRetryAttempts);
        }

        Ok(EngineConfig {
            default_max_concurrency,
            per_repo_max_concurrency: self.per_repo_max_concurrency,
            dedup_window,
            dispatch_timeout,
            retry,
        })
    }
}
