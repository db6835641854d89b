//! Client configuration and `DIFY_*` environment loading.

use std::time::Duration;

use crate::errors::DifyError;
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";

/// Configuration for a [`DifyClient`](crate::DifyClient).
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// App API key used for bearer auth.
    pub api_key: String,
    /// API root including the version segment, for example `https://host/v1`.
    pub base_url: String,
    /// Timeout for regular requests.
    pub timeout: Duration,
    /// Timeout for streaming requests.
    pub stream_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Creates a config with default endpoint, timeouts and retry policy.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    /// Builds a config from the process environment.
    ///
    /// - `DIFY_API_KEY` (required)
    /// - `DIFY_API_BASE_URL`
    /// - `DIFY_TIMEOUT_SECS`, `DIFY_STREAM_TIMEOUT_SECS`
    /// - `DIFY_MAX_RETRIES`, `DIFY_RETRY_DELAY_MS`
    pub fn from_env() -> Result<Self, DifyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, DifyError> {
        let api_key = lookup("DIFY_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(DifyError::Config("missing DIFY_API_KEY".into()));
        }
        let mut config = Self::new(api_key.trim());
        if let Some(base_url) = lookup("DIFY_API_BASE_URL").filter(|v| !v.trim().is_empty()) {
            config.base_url = base_url.trim().to_string();
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DIFY_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DIFY_STREAM_TIMEOUT_SECS")? {
            config.stream_timeout = Duration::from_secs(secs);
        }
        if let Some(max_retries) = parse_var::<u32>(&lookup, "DIFY_MAX_RETRIES")? {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DIFY_RETRY_DELAY_MS")? {
            config.retry.retry_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// Overrides the API base URL (self-hosted instances, test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), DifyError> {
        if self.api_key.trim().is_empty() {
            return Err(DifyError::Config("api_key must not be empty".into()));
        }
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(DifyError::Config(format!(
                "base_url must start with http:// or https://, got {base:?}"
            )));
        }
        Ok(())
    }

    pub(crate) fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, DifyError> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DifyError::Config(format!("invalid value for {key}: {raw:?}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_platform_conventions() {
        let config = ClientConfig::new("app-key");
        assert_eq!(config.base_url, "https://api.dify.ai/v1");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.stream_timeout, Duration::from_secs(60));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn env_requires_api_key() {
        let err = ClientConfig::from_lookup(lookup(&[])).expect_err("missing key");
        assert!(matches!(err, DifyError::Config(message) if message.contains("DIFY_API_KEY")));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("DIFY_API_KEY", " app-key "),
            ("DIFY_API_BASE_URL", "http://localhost/v1/"),
            ("DIFY_TIMEOUT_SECS", "5"),
            ("DIFY_MAX_RETRIES", "4"),
            ("DIFY_RETRY_DELAY_MS", "250"),
        ]))
        .expect("config");
        assert_eq!(config.api_key, "app-key");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.stream_timeout, Duration::from_secs(60));
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.retry_delay, Duration::from_millis(250));
        assert_eq!(
            config.endpoint_url("chat-messages"),
            "http://localhost/v1/chat-messages"
        );
    }

    #[test]
    fn env_rejects_unparseable_numbers() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("DIFY_API_KEY", "k"),
            ("DIFY_MAX_RETRIES", "many"),
        ]))
        .expect_err("bad number");
        assert!(matches!(err, DifyError::Config(message) if message.contains("DIFY_MAX_RETRIES")));
    }

    #[test]
    fn validate_rejects_non_http_base_url() {
        let config = ClientConfig::new("k").base_url("ftp://example");
        assert!(config.validate().is_err());
        assert!(ClientConfig::new("k").validate().is_ok());
    }
}
