//! Runtime settings.
//!
//! Loaded from an optional `kindred.toml` next to the binary, overridden
//! by `KINDRED__*` environment variables (e.g. `KINDRED__REDIS_URL`).
//! Secrets (master key, provider API keys) normally arrive via the
//! environment / `.env`.

use serde::Deserialize;

/// Application settings with serde-level defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database path for jobs, dead letters and the audit log
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Redis URL for the response cache and rate limiters.
    /// When unset, both run on their in-memory fallbacks.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Base64-encoded 32+ byte master secret for at-rest encryption
    #[serde(default)]
    pub master_secret: Option<String>,

    /// Primary provider key (OpenAI)
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Fallback provider key (Groq)
    #[serde(default)]
    pub groq_api_key: Option<String>,

    /// Pipeline worker count
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries before a job is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-user trailing-24h spend cap in USD
    #[serde(default = "default_daily_cost_cap")]
    pub daily_cost_cap_usd: f64,

    /// Chat submissions allowed per window per user
    #[serde(default = "default_chat_limit")]
    pub chat_rate_limit: u32,

    /// Chat rate-limit window in seconds
    #[serde(default = "default_chat_window")]
    pub chat_rate_window_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database_path() -> String {
    "data/kindred.db".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_daily_cost_cap() -> f64 {
    5.0
}

fn default_chat_limit() -> u32 {
    10
}

fn default_chat_window() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            redis_url: None,
            master_secret: None,
            openai_api_key: None,
            groq_api_key: None,
            workers: default_workers(),
            max_retries: default_max_retries(),
            daily_cost_cap_usd: default_daily_cost_cap(),
            chat_rate_limit: default_chat_limit(),
            chat_rate_window_secs: default_chat_window(),
        }
    }
}

impl Settings {
    /// Load settings from `kindred.toml` (optional) and the environment.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("kindred").required(false))
            .add_source(config::Environment::with_prefix("KINDRED").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.chat_rate_limit, 10);
        assert!(settings.redis_url.is_none());
    }
}
