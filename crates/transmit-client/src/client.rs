//! The client handle and its builder.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::TransmitConfig;
use crate::connection::{ConnectionManager, ReconnectState};
use crate::control_plane::{ControlPlane, ControlPlaneFactory, HttpControlPlane};
use crate::heartbeat::HeartbeatMonitor;
use crate::hooks::{HookEvent, HookKind, Hooks};
use crate::protocol::events_url;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::transport::{SseTransportFactory, TransportFactory};
use crate::types::{
    ClientSession, ConnectionState, CredentialProvider, Error, HandlerId, NoCredentials, Result,
    UidProvider, random_uid,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected pub/sub client.
///
/// The connection runs on a background task spawned by
/// [`TransmitBuilder::build`]. Dropping the client closes it.
pub struct Transmit {
    session: ClientSession,
    registry: Arc<SubscriptionRegistry>,
    hooks: Arc<Hooks>,
    status: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl Transmit {
    pub fn builder(config: TransmitConfig) -> TransmitBuilder {
        TransmitBuilder::new(config)
    }

    /// Build a client with the default uid, credentials, and HTTP collaborators.
    pub fn connect(config: TransmitConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn uid(&self) -> &str {
        self.session.uid()
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Run `callback` each time the connection enters `status`.
    pub fn on<F>(&self, status: ConnectionState, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.register(HookKind::StatusChange, move |event| {
            if let HookEvent::StatusChange { status: current } = event
                && *current == status
            {
                callback();
            }
        });
        self
    }

    /// Lifecycle hooks. Hooks registered here miss events that fired before
    /// registration; use [`TransmitBuilder::hook`] to observe from the start.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// The subscription for `channel`, created in `Pending` status if there is none.
    /// No request is sent until [`Subscription::create`].
    pub fn subscription(&self, channel: &str) -> Subscription {
        Subscription::new(self.registry.subscription(channel), Arc::clone(&self.registry))
    }

    /// Register `handler` on `channel` and join it if necessary.
    ///
    /// Resolves once the server has confirmed the join. If the client is not
    /// connected yet, the join is sent as soon as it is.
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let subscription = self.subscription(channel);
        let id = subscription.on_message(handler);
        subscription.create().await?;
        Ok(id)
    }

    /// Remove a handler from `channel`.
    ///
    /// When it was the last handler, the channel is left on the server if
    /// `force_leave` is `Some(true)`, or if it is `None` and the client is
    /// configured with `leave_on_last_handler`. Returns `false` if no such
    /// handler was registered.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        id: HandlerId,
        force_leave: Option<bool>,
    ) -> Result<bool> {
        match self.registry.get(channel) {
            Some(entry) => self.registry.remove_handler(&entry, id, force_leave).await,
            None => Ok(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.registry.is_closed()
    }

    /// Stop the connection and cancel pending subscribes. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(uid = self.session.uid(), "Closing transmit client");
        self.registry.close();
        self.shutdown.cancel();
    }
}

impl Drop for Transmit {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmit")
            .field("uid", &self.session.uid())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Configures collaborators before the connection starts.
pub struct TransmitBuilder {
    config: TransmitConfig,
    uid_provider: Box<dyn UidProvider>,
    credentials: Arc<dyn CredentialProvider>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    control_plane_factory: Option<ControlPlaneFactory>,
    hooks: Hooks,
}

impl TransmitBuilder {
    pub fn new(config: TransmitConfig) -> Self {
        Self {
            config,
            uid_provider: Box::new(random_uid),
            credentials: Arc::new(NoCredentials),
            transport_factory: None,
            control_plane_factory: None,
            hooks: Hooks::new(),
        }
    }

    pub fn uid_provider(mut self, provider: impl UidProvider + 'static) -> Self {
        self.uid_provider = Box::new(provider);
        self
    }

    /// Headers sent with the event stream and every control-plane request.
    pub fn credentials(mut self, credentials: impl CredentialProvider + 'static) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    /// Replace the server-sent events transport.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Replace the HTTP control plane. Called once with the normalized base URL
    /// and the session.
    pub fn control_plane_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&str, &ClientSession) -> Arc<dyn ControlPlane> + Send + 'static,
    {
        self.control_plane_factory = Some(Box::new(factory));
        self
    }

    /// Register a hook that observes events from the first connection attempt on.
    pub fn hook<F>(self, kind: HookKind, handler: F) -> Self
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.register(kind, handler);
        self
    }

    /// Validate the config and start connecting. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Transmit> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let base_url = self.config.validate()?;
        let session = ClientSession::new(self.uid_provider.uid());
        let url = events_url(&base_url, &session)?;

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let control: Arc<dyn ControlPlane> = match self.control_plane_factory {
            Some(factory) => factory(&base_url, &session),
            None => Arc::new(HttpControlPlane::new(
                http.clone(),
                &base_url,
                session.clone(),
                Arc::clone(&self.credentials),
                self.config.request_timeout(),
            )?),
        };
        let transport_factory: Arc<dyn TransportFactory> = match self.transport_factory {
            Some(factory) => factory,
            None => Arc::new(SseTransportFactory::new(http, Arc::clone(&self.credentials))),
        };

        let hooks = Arc::new(self.hooks);
        let (status_tx, status) = watch::channel(ConnectionState::Initializing);
        let shutdown = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            control,
            Arc::clone(&hooks),
            status.clone(),
            shutdown.clone(),
            self.config.leave_on_last_handler,
        ));
        let manager = ConnectionManager::new(
            url,
            transport_factory,
            status_tx,
            ReconnectState::new(
                self.config.max_reconnect_attempts,
                self.config.reconnect_backoff,
            ),
            HeartbeatMonitor::new(self.config.heartbeat_timeout()),
            Arc::clone(&registry),
            Arc::clone(&hooks),
            shutdown.clone(),
        );
        runtime.spawn(manager.run());
        tracing::info!(uid = session.uid(), base_url = %base_url, "Transmit client started");

        Ok(Transmit {
            session,
            registry,
            hooks,
            status,
            shutdown,
        })
    }
}

impl fmt::Debug for TransmitBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport_factory.is_some())
            .field("custom_control_plane", &self.control_plane_factory.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
