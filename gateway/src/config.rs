//! Environment-sourced configuration (ambient stack, §1 "added"), matching
//! `main.rs`'s `env::var(...).unwrap_or_else(...)` style rather than a
//! config-file parser — the teacher doesn't carry one for this service
//! either.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub bind_addr: String,
    pub heartbeat_interval_ms: u64,
    pub subscription_limit: u32,
    pub connection_limit: u32,
    pub resume_ttl: Duration,
    pub bridge_url: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Reads configuration from the process environment. Missing values
    /// fall back to sane defaults; malformed numeric values fall back too
    /// rather than failing startup over a typo'd env var.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            heartbeat_interval_ms: parse_env_or("HEARTBEAT_INTERVAL_MS", 45_000),
            subscription_limit: parse_env_or("SUBSCRIPTION_LIMIT", 500),
            connection_limit: parse_env_or("CONNECTION_LIMIT", 10_000),
            resume_ttl: Duration::from_secs(parse_env_or("RESUME_TTL_SECS", 45)),
            bridge_url: std::env::var("BRIDGE_URL").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_on_missing_or_malformed_value() {
        std::env::remove_var("GATEWAY_TEST_MISSING");
        assert_eq!(parse_env_or::<u32>("GATEWAY_TEST_MISSING", 7), 7);

        std::env::set_var("GATEWAY_TEST_MALFORMED", "not-a-number");
        assert_eq!(parse_env_or::<u32>("GATEWAY_TEST_MALFORMED", 7), 7);
        std::env::remove_var("GATEWAY_TEST_MALFORMED");
    }
}
