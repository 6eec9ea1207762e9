use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::gateway::policy::RateLimitPolicy;

/// Environment variable holding the gateway's maximum concurrency
pub const MAX_CONCURRENCY_ENV: &str = "GEMINI_MAX_CONCURRENCY";

/// Environment variable holding the Gemini API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Largest accepted `gateway.policy.max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Top-level configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Gateway (queue, coalescing, backoff) configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Gemini provider configuration
    #[serde(default)]
    pub gemini: GeminiConfig,
}

/// Gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Maximum number of operations admitted at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long an identical call is coalesced with an in-progress one
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Retry policy for rate-limited calls
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Retry policy, expressed in milliseconds for the config file
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_factor")]
    pub factor: f64,
}

/// Gemini provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    /// API key; falls back to GEMINI_API_KEY when empty
    #[serde(default)]
    pub api_key: String,

    /// Model name to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the Generative Language API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum tokens to generate
    #[serde(default)]
    pub max_output_tokens: Option<usize>,

    /// Temperature setting for generation
    #[serde(default)]
    pub temperature: Option<f32>,
}

// Default values for optional configuration
fn default_max_concurrency() -> usize {
    2
}

fn default_coalesce_window_ms() -> u64 {
    5_000
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_factor() -> f64 {
    2.0
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            coalesce_window_ms: default_coalesce_window_ms(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            factor: default_factor(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            api_base: default_api_base(),
            timeout_seconds: default_timeout(),
            max_output_tokens: None,
            temperature: None,
        }
    }
}

impl Config {
    /// Load configuration from a file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config = toml::from_str(&config_text)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.gateway.apply_env();
        config.gemini.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.gateway.apply_env();
        config.gemini.apply_env();
        config
    }

    fn validate(&self) -> Result<()> {
        let policy = &self.gateway.policy;
        if !policy.factor.is_finite() || policy.factor < 1.0 {
            anyhow::bail!("gateway.policy.factor must be a finite value >= 1.0, got {}", policy.factor);
        }
        if policy.max_retries > MAX_RETRIES_LIMIT {
            anyhow::bail!(
                "gateway.policy.max_retries must be at most {}, got {}",
                MAX_RETRIES_LIMIT,
                policy.max_retries
            );
        }
        if policy.base_delay_ms > policy.max_delay_ms {
            anyhow::bail!(
                "gateway.policy.base_delay_ms ({}) exceeds max_delay_ms ({})",
                policy.base_delay_ms,
                policy.max_delay_ms
            );
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Defaults with the concurrency limit read from the environment
    pub fn from_env() -> Self {
        let mut config = GatewayConfig::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = env::var(MAX_CONCURRENCY_ENV) {
            self.max_concurrency = parse_max_concurrency(Some(&raw));
        } else if self.max_concurrency == 0 {
            self.max_concurrency = default_max_concurrency();
        }
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            base_delay: Duration::from_millis(self.policy.base_delay_ms),
            max_delay: Duration::from_millis(self.policy.max_delay_ms),
            max_retries: self.policy.max_retries,
            factor: self.policy.factor,
        }
    }
}

impl GeminiConfig {
    fn apply_env(&mut self) {
        if self.api_key.is_empty() {
            if let Ok(key) = env::var(API_KEY_ENV) {
                self.api_key = key;
            }
        }
    }
}

/// Parse a max-concurrency value, falling back to the default when
/// missing, unparseable or zero
pub fn parse_max_concurrency(raw: Option<&str>) -> usize {
    match raw.map(str::trim).map(str::parse::<usize>) {
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            warn!(
                "Ignoring invalid {} value {:?}, using {}",
                MAX_CONCURRENCY_ENV,
                raw.unwrap_or_default(),
                default_max_concurrency()
            );
            default_max_concurrency()
        }
        None => default_max_concurrency(),
    }
}
