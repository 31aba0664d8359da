//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub(crate) const DEFAULT_MAX_BACKOFF_MS: u64 = 15_000;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed { interval_ms: u64 },
    /// `initial_ms` doubled per attempt, capped at `max_ms`: 1s, 2s, 4s, 8s, 15s, 15s, ...
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let exp = attempt.saturating_sub(1).min(30);
                Duration::from_millis(initial_ms.saturating_mul(1u64 << exp).min(max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    /// Server base URL, e.g. `https://example.com`. Endpoints are appended to it.
    pub base_url: String,
    /// Reconnect attempts after a connection loss before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Backoff,
    /// Dead-connection timeout. `None` disables heartbeat monitoring.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Leave the channel on the server once its last handler is removed.
    pub leave_on_last_handler: bool,
    /// Timeout for subscribe/unsubscribe requests.
    pub request_timeout_ms: u64,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: Backoff::default(),
            heartbeat_timeout_ms: None,
            leave_on_last_handler: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl TransmitConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON config document. Omitted fields take their defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::InvalidConfig(format!("parse: {e}")))
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check the config and return the base URL without trailing slashes.
    pub fn validate(&self) -> Result<String> {
        let base_url = self.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::InvalidConfig("base_url is required".to_string()));
        }
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("base_url {base_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "base_url must be http or https, got {}",
                parsed.scheme()
            )));
        }
        if self.heartbeat_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "heartbeat_timeout_ms must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if let Backoff::Exponential { initial_ms, max_ms } = self.reconnect_backoff
            && (initial_ms == 0 || max_ms < initial_ms)
        {
            return Err(Error::InvalidConfig(format!(
                "exponential backoff needs 0 < initial_ms <= max_ms, got {initial_ms}..{max_ms}"
            )));
        }
        if self.reconnect_backoff == (Backoff::Fixed { interval_ms: 0 }) {
            return Err(Error::InvalidConfig(
                "fixed backoff interval_ms must be positive".to_string(),
            ));
        }
        Ok(base_url.to_string())
    }
}
