//! Configuration types and defaults for the orchestration stack.

use std::time::Duration;

use serde::Deserialize;

/// Default model identifier requested from the gateway.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
/// Default max output tokens per model round.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
/// Default bound on reasoning rounds per run.
pub const DEFAULT_MAX_ROUNDS: u32 = 5;
/// Default cap on rows kept from a query result.
pub const DEFAULT_ROW_CAP: usize = 1_000;
/// Default byte ceiling for any serialized tool result.
pub const DEFAULT_RESULT_BYTE_CEILING: usize = 100_000;

// === Retry ===

/// Raw retry configuration as loaded from a config source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Resolve a policy from raw config, falling back to defaults.
    #[must_use]
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let defaults = Self::default();
        Self {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }

    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Clamp to a sane range to guard against NaN/negative from misconfigured values
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }
}

// === Tool Service ===

/// Configuration for the remote tool-execution service.
#[derive(Debug, Clone)]
pub struct ToolServiceConfig {
    /// Base URL of the data service, without a trailing slash.
    pub base_url: String,
    /// Deadline for a single tool call round trip.
    pub call_timeout: Duration,
    /// Deadline for the session handshake.
    pub handshake_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ToolServiceConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            call_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// === Model Gateway ===

/// Configuration for the model gateway client.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway, without a trailing slash.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_output_tokens: u32,
    /// Deadline for the initial response (headers) of a streaming request.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

// === Engine ===

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum reasoning rounds before the partial-answer fallback.
    pub max_rounds: u32,
    /// Row cap applied to row-oriented tool results.
    pub row_cap: usize,
    /// Byte ceiling for any serialized tool result.
    pub result_byte_ceiling: usize,
    /// Run the pre-flight ambiguity check before round 1.
    pub preflight_clarification: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            row_cap: DEFAULT_ROW_CAP,
            result_byte_ceiling: DEFAULT_RESULT_BYTE_CEILING,
            preflight_clarification: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn delay_clamps_misconfigured_values() {
        let policy = RetryPolicy {
            enabled: true,
            max_retries: 3,
            initial_delay: -5.0,
            max_delay: f64::NAN,
            exponential_base: 2.0,
        };
        let delay = policy.delay_for_attempt(1);
        assert!(delay <= Duration::from_secs(300));
    }

    #[test]
    fn from_config_fills_defaults() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_retries: Some(7),
            ..RetryConfig::default()
        });
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_delay, 1.0);
        assert!(policy.enabled);
    }

    #[test]
    fn service_config_trims_trailing_slash() {
        let cfg = ToolServiceConfig::new("https://data.example.com/");
        assert_eq!(cfg.base_url, "https://data.example.com");
    }
}
