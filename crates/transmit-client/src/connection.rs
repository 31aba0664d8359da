//! Connection management: event loop, reconnection, and heartbeat timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Backoff;
use crate::heartbeat::{HeartbeatMonitor, sleep_until_opt};
use crate::hooks::{HookEvent, Hooks};
use crate::protocol::{Inbound, decode_frame};
use crate::registry::SubscriptionRegistry;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::ConnectionState;

// ---------------------------------------------------------------------------
// Reconnect bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ReconnectState {
    attempt_count: u32,
    max_attempts: u32,
    backoff: Backoff,
}

impl ReconnectState {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            backoff,
        }
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Claim the next attempt: its 1-based number and the delay before it.
    /// `None` once `max_attempts` have been used.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempt_count >= self.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        Some((self.attempt_count, self.backoff.delay(self.attempt_count)))
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

enum Wake {
    Shutdown,
    Transport(Option<TransportEvent>),
    HeartbeatExpired,
    Reconnect,
}

enum LoopAction {
    Continue,
    Stop,
}

/// Owns the transport and drives the connection state machine. Runs as one
/// task; every transition happens on that task.
pub(crate) struct ConnectionManager {
    url: Url,
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    status_tx: watch::Sender<ConnectionState>,
    reconnect: ReconnectState,
    reconnect_at: Option<Instant>,
    heartbeat: HeartbeatMonitor,
    registry: Arc<SubscriptionRegistry>,
    hooks: Arc<Hooks>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: Url,
        factory: Arc<dyn TransportFactory>,
        status_tx: watch::Sender<ConnectionState>,
        reconnect: ReconnectState,
        heartbeat: HeartbeatMonitor,
        registry: Arc<SubscriptionRegistry>,
        hooks: Arc<Hooks>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            factory,
            transport: None,
            status_tx,
            reconnect,
            reconnect_at: None,
            heartbeat,
            registry,
            hooks,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        self.connect();

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                event = next_event(&mut self.transport) => Wake::Transport(event),
                _ = sleep_until_opt(self.heartbeat.deadline()) => Wake::HeartbeatExpired,
                _ = sleep_until_opt(self.reconnect_at) => Wake::Reconnect,
            };

            let action = match wake {
                Wake::Shutdown => {
                    tracing::info!("Close requested");
                    LoopAction::Stop
                }
                Wake::Transport(Some(TransportEvent::Open)) => {
                    self.on_open();
                    LoopAction::Continue
                }
                Wake::Transport(Some(TransportEvent::Message(data))) => {
                    self.on_frame(&data);
                    LoopAction::Continue
                }
                Wake::Transport(Some(TransportEvent::Error(reason))) => self.on_error(&reason),
                Wake::Transport(None) => self.on_error("transport closed"),
                Wake::HeartbeatExpired => {
                    tracing::warn!("Heartbeat timeout");
                    self.on_error("heartbeat timeout")
                }
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.connect();
                    LoopAction::Continue
                }
            };
            if let LoopAction::Stop = action {
                break;
            }
        }

        self.close();
    }

    fn state(&self) -> ConnectionState {
        *self.status_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::debug!(status = %state, "Connection state changed");
            self.hooks.emit(&HookEvent::StatusChange { status: state });
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.heartbeat.clear();
    }

    fn connect(&mut self) {
        self.drop_transport();
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.url, "Connecting");
        self.transport = Some(self.factory.open(&self.url));
    }

    fn on_open(&mut self) {
        self.set_state(ConnectionState::Connected);
        self.reconnect.reset();
        self.reconnect_at = None;
        self.heartbeat.reset();
        tracing::info!("Connected");
        self.registry.on_connected();
    }

    fn on_frame(&mut self, data: &str) {
        match decode_frame(data) {
            Ok(Inbound::Heartbeat) => {
                tracing::trace!("Heartbeat received");
                self.heartbeat.reset();
            }
            Ok(Inbound::Message(frame)) => self.registry.dispatch(&frame.channel, &frame.payload),
            Err(e) => tracing::warn!("Failed to decode frame: {e}"),
        }
    }

    fn on_error(&mut self, reason: &str) -> LoopAction {
        tracing::warn!("Connection lost: {reason}");
        self.drop_transport();
        if self.state() != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Disconnected);
            self.set_state(ConnectionState::Reconnecting);
        }

        let Some((attempt, delay)) = self.reconnect.next_attempt() else {
            tracing::error!(
                max_attempts = self.reconnect.max_attempts,
                "Reconnect attempts exhausted, closing"
            );
            self.hooks.emit(&HookEvent::ReconnectFailed);
            self.registry.close();
            self.shutdown.cancel();
            return LoopAction::Stop;
        };

        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
        self.hooks.emit(&HookEvent::ReconnectAttempt { attempt });
        LoopAction::Continue
    }

    fn close(&mut self) {
        self.drop_transport();
        self.reconnect_at = None;
        self.registry.close();
        tracing::debug!("Connection manager stopped");
    }
}

async fn next_event(transport: &mut Option<Box<dyn Transport>>) -> Option<TransportEvent> {
    match transport {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}
