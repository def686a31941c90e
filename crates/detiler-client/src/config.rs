//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL of the detiler service, e.g. `http://127.0.0.1:8080`.
    pub url: String,
    /// Per-attempt request timeout.
    pub timeout_ms: u64,
    pub enable_retry_strategy: bool,
    pub retry_strategy: RetryStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 10_000,
            enable_retry_strategy: false,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_retry(mut self, strategy: RetryStrategy) -> Self {
        self.enable_retry_strategy = true;
        self.retry_strategy = strategy;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The retry strategy in effect, if retries are enabled.
    pub fn retry(&self) -> Option<&RetryStrategy> {
        self.enable_retry_strategy.then_some(&self.retry_strategy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Double the delay after every failed attempt.
    pub is_exponential: bool,
    pub delay_ms: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            retries: 3,
            is_exponential: false,
            delay_ms: 0,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        if self.is_exponential {
            base.saturating_mul(2u32.saturating_pow(attempt))
        } else {
            base
        }
    }
}
