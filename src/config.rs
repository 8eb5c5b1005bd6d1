use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RelayError;

/// A session ends after this much idle time; the next request starts a new one.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// TTL for aggregated responses recovered from a client disconnect.
pub const STREAM_RESULT_TTL: Duration = Duration::from_secs(10 * 60);
/// TTL for non-streaming dedup cache entries.
pub const DEDUP_TTL: Duration = Duration::from_secs(90);
/// TTL for the `/v1/models` micro-cache.
pub const MODEL_LIST_TTL: Duration = Duration::from_secs(5 * 60);
/// SSE heartbeat comment interval while relaying.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_ms: 500,
            backoff_max_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream base URL, no trailing slash (e.g. `https://api.openai.com/v1`).
    pub upstream_base: String,
    /// Upstream API key, injected as `Authorization: Bearer <key>`.
    pub upstream_key: String,
    /// Optional shared secret clients must present; `None` disables the check.
    pub proxy_token: Option<String>,
    /// Injected as the `user` field when the request body has none.
    pub default_user: String,
    /// Client model name -> upstream model name. Unmapped names pass through.
    pub model_aliases: HashMap<String, String>,
    pub retry: RetryConfig,
    /// Cosmetic $/1M-token multipliers for the session cost display.
    pub cost_input_per_m: f64,
    pub cost_output_per_m: f64,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        let upstream_key = env_nonempty("CHAT_RELAY_UPSTREAM_KEY").ok_or_else(|| {
            RelayError::Config(
                "CHAT_RELAY_UPSTREAM_KEY is required; refusing to start without an upstream API key"
                    .to_string(),
            )
        })?;

        let upstream_base = env_nonempty("CHAT_RELAY_UPSTREAM_BASE")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let mut model_aliases = default_model_aliases();
        if let Some(raw) = env_nonempty("CHAT_RELAY_MODEL_ALIASES") {
            match parse_model_aliases(&raw) {
                Ok(map) => model_aliases = map,
                Err(e) => {
                    warn!("ignoring invalid CHAT_RELAY_MODEL_ALIASES: {e}");
                }
            }
        }

        let mut retry = RetryConfig::default();
        if let Some(n) = env_parse::<u32>("CHAT_RELAY_RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("CHAT_RELAY_RETRY_BACKOFF_MS") {
            retry.backoff_ms = n;
        }

        Ok(Self {
            upstream_base,
            upstream_key,
            proxy_token: env_nonempty("CHAT_RELAY_TOKEN"),
            default_user: env_nonempty("CHAT_RELAY_DEFAULT_USER")
                .unwrap_or_else(|| "chat-relay".to_string()),
            model_aliases,
            retry,
            cost_input_per_m: env_parse::<f64>("CHAT_RELAY_COST_INPUT_PER_M").unwrap_or(0.0),
            cost_output_per_m: env_parse::<f64>("CHAT_RELAY_COST_OUTPUT_PER_M").unwrap_or(0.0),
        })
    }

    /// The Model Alias Resolver: mapped names are rewritten, everything else
    /// passes through verbatim so forward-compatible model names never block.
    pub fn resolve_model<'a>(&'a self, name: &'a str) -> &'a str {
        self.model_aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }
}

fn default_model_aliases() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("gpt-4".to_string(), "gpt-4o".to_string());
    map.insert("gpt-3.5-turbo".to_string(), "gpt-4o-mini".to_string());
    map
}

fn parse_model_aliases(raw: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    serde_json::from_str::<HashMap<String, String>>(raw)
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Home directory for relay state (request logs). Override with
/// `CHAT_RELAY_HOME`, mainly for tests.
pub fn relay_home_dir() -> PathBuf {
    if let Some(dir) = env_nonempty("CHAT_RELAY_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chat-relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn test_config() -> RelayConfig {
        RelayConfig {
            upstream_base: "https://api.example.com/v1".to_string(),
            upstream_key: "sk-test".to_string(),
            proxy_token: None,
            default_user: "chat-relay".to_string(),
            model_aliases: default_model_aliases(),
            retry: RetryConfig::default(),
            cost_input_per_m: 0.0,
            cost_output_per_m: 0.0,
        }
    }

    #[test]
    fn mapped_model_is_rewritten() {
        let cfg = test_config();
        assert_eq!(cfg.resolve_model("gpt-4"), "gpt-4o");
    }

    #[test]
    fn unmapped_model_passes_through() {
        let cfg = test_config();
        assert_eq!(cfg.resolve_model("custom-llm"), "custom-llm");
    }

    #[test]
    fn alias_table_parses_from_json() {
        let map = parse_model_aliases(r#"{"a":"b","c":"d"}"#).expect("parse");
        assert_eq!(map.get("a").map(String::as_str), Some("b"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn invalid_alias_json_is_an_error() {
        assert!(parse_model_aliases("not json").is_err());
    }
}
