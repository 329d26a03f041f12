//! Typed configuration.
//!
//! [`Config`] comes from environment variables and is loaded once at
//! startup; secrets are wrapped in `SecretString` to keep them out of logs.
//! [`EngineConfig`] holds the run's tuning knobs and is read from a TOML file,
//! with every field defaulted.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::RequestParameters;
use crate::retry::RetryPolicy;
use crate::throttle::RequestThrottle;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub anthropic_api_key: Option<SecretString>,
    pub openai_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this. API keys are
    /// optional here; the submitter asks for the one it needs.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            anthropic_api_key: optional_var("ANTHROPIC_API_KEY").map(SecretString::from),
            openai_api_key: optional_var("OPENAI_API_KEY").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// The API key for a provider, or a configuration error naming the
    /// variable that must be set.
    pub fn api_key(&self, provider: &str) -> Result<&SecretString> {
        let (key, var) = match provider {
            "anthropic" => (self.anthropic_api_key.as_ref(), "ANTHROPIC_API_KEY"),
            "openai" => (self.openai_api_key.as_ref(), "OPENAI_API_KEY"),
            other => return Err(Error::Config(format!("unknown provider '{other}'"))),
        };
        key.ok_or_else(|| {
            Error::Config(format!("required environment variable {var} is not set"))
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Engine tuning, as written in `evalq.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Requests admitted per rolling window.
    pub requests_per_window: u32,
    /// Length of the rolling window.
    pub window_secs: u64,
    /// Maximum submissions in flight at once.
    pub max_concurrency: usize,
    /// Attempts per item, including the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Base delay after the API reports a rate limit.
    pub rate_limit_backoff_ms: u64,
    /// Per-attempt timeout. 0 disables it.
    pub request_timeout_secs: u64,
    pub model: String,
    /// Token limit per completion.
    pub max_tokens: u32,
    pub temperature: f64,
    /// Completions requested per item.
    pub n: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window_secs: 60,
            max_concurrency: 16,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            rate_limit_backoff_ms: 10_000,
            request_timeout_secs: 30,
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 32,
            temperature: 0.0,
            n: 1,
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_window == 0 {
            return Err(Error::Config(
                "requests_per_window must be greater than 0".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(Error::Config("window_secs must be greater than 0".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(Error::Config(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.n == 0 {
            return Err(Error::Config("n must be at least 1".to_string()));
        }
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn throttle(&self) -> RequestThrottle {
        RequestThrottle::new(
            self.requests_per_window,
            Duration::from_secs(self.window_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            rate_limit_base: Duration::from_millis(self.rate_limit_backoff_ms),
        }
    }

    pub fn request_parameters(&self) -> RequestParameters {
        RequestParameters {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            n: self.n,
        }
    }
}
