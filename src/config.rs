//! Runtime configuration from `CONVOSYNC_*` environment variables.
//!
//! Unset or unparseable numeric variables fall back to their defaults; empty
//! strings count as unset.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use crate::connection::BackoffPolicy;
use crate::dispatch::DEFAULT_DEDUPE_WINDOW;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// HTTP origin of the console, e.g. `https://console.example.com`. The REST
    /// API lives under `/api`, the push socket at `/api/ws`.
    pub base_url: String,
    /// Bearer token for the API and the push socket.
    pub token: Option<String>,
    /// Scope (organization) to subscribe to when none is given explicitly.
    pub scope: Option<String>,
    pub backoff: BackoffPolicy,
    /// Number of recent push event ids remembered for de-duplication.
    pub dedupe_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            token: None,
            scope: None,
            backoff: BackoffPolicy::default(),
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = env_string("CONVOSYNC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let base_ms = env_parse("CONVOSYNC_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS);
        let max_ms = env_parse("CONVOSYNC_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS).max(base_ms);

        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: env_string("CONVOSYNC_TOKEN"),
            scope: env_string("CONVOSYNC_SCOPE"),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                max_attempts: env_parse("CONVOSYNC_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            },
            dedupe_window: env_parse("CONVOSYNC_DEDUPE_WINDOW", DEFAULT_DEDUPE_WINDOW),
        }
    }

    /// Root of the REST API.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("{}/api", self.base_url.trim_end_matches('/'))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
