//! Request/response channel used to join and leave channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::protocol::{ChannelRequest, SUBSCRIBE_PATH, UNSUBSCRIBE_PATH, endpoint};
use crate::types::{ClientSession, ControlPlaneError, CredentialProvider, Error};

/// Join/leave requests. A single attempt per call; callers decide about retries.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn join(&self, channel: &str) -> Result<(), ControlPlaneError>;
    async fn leave(&self, channel: &str) -> Result<(), ControlPlaneError>;
}

/// Builds the control plane from the validated base URL and the session.
pub type ControlPlaneFactory =
    Box<dyn FnOnce(&str, &ClientSession) -> Arc<dyn ControlPlane> + Send>;

/// Control plane over `POST /__transmit/subscribe` and `POST /__transmit/unsubscribe`.
pub struct HttpControlPlane {
    http: reqwest::Client,
    subscribe_url: Url,
    unsubscribe_url: Url,
    session: ClientSession,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        session: ClientSession,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            subscribe_url: endpoint(base_url, SUBSCRIBE_PATH)?,
            unsubscribe_url: endpoint(base_url, UNSUBSCRIBE_PATH)?,
            session,
            credentials,
            timeout,
        })
    }

    async fn post(&self, url: &Url, channel: &str) -> Result<(), ControlPlaneError> {
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeout)
            .headers(self.credentials.headers())
            .json(&ChannelRequest {
                uid: self.session.uid(),
                channel,
            })
            .send()
            .await?;
        let status = response.status();
        // Drain the body so the connection can be reused.
        if let Err(e) = response.bytes().await {
            tracing::debug!(channel, "failed to read control-plane response body: {e}");
        }
        if !status.is_success() {
            return Err(ControlPlaneError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn join(&self, channel: &str) -> Result<(), ControlPlaneError> {
        self.post(&self.subscribe_url, channel).await
    }

    async fn leave(&self, channel: &str) -> Result<(), ControlPlaneError> {
        self.post(&self.unsubscribe_url, channel).await
    }
}
