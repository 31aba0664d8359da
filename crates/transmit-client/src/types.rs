//! Public types for the transmit-client crate.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Connection status of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Client constructed, no connection attempted yet.
    Initializing,
    /// A (re)connect attempt is in progress.
    Connecting,
    /// The stream is open.
    Connected,
    /// The stream failed; a reconnect decision has not been made yet.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side state of a channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Requested locally, join not confirmed by the server.
    Pending,
    /// Join confirmed by the server.
    Created,
    /// Leave confirmed by the server. Terminal.
    Deleted,
}

/// Identity of this client towards the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    uid: Arc<str>,
}

impl ClientSession {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Arc::from(uid.into()),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }
}

/// Handle of a registered message handler, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// Callback invoked with the payload of every message on a channel.
pub type MessageHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Source of the client uid. Implemented for plain closures.
pub trait UidProvider: Send + Sync {
    fn uid(&self) -> String;
}

impl<F> UidProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn uid(&self) -> String {
        self()
    }
}

/// Default [`UidProvider`]: a random UUID v4.
pub fn random_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Supplies credential headers added to every request the client makes.
pub trait CredentialProvider: Send + Sync {
    fn headers(&self) -> HeaderMap;
}

/// Sends no extra headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }
}

/// Sends a fixed `X-XSRF-TOKEN` header.
#[derive(Debug, Clone)]
pub struct XsrfToken(pub String);

pub(crate) const XSRF_HEADER: &str = "x-xsrf-token";

impl CredentialProvider for XsrfToken {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.0) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(XSRF_HEADER), value);
            }
            Err(e) => {
                tracing::warn!("XSRF token is not a valid header value, omitting it: {e}");
            }
        }
        headers
    }
}

/// Failure of a single control-plane request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("server responded with HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(e: reqwest::Error) -> Self {
        ControlPlaneError::Transport(e.to_string())
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("subscribe to {channel} failed: {source}")]
    SubscribeFailed {
        channel: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("unsubscribe from {channel} failed: {source}")]
    UnsubscribeFailed {
        channel: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("subscription to {0} was deleted")]
    SubscriptionDeleted(String),

    #[error("subscription handle for {0} was discarded after a failed join")]
    StaleSubscription(String),

    #[error("client closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
