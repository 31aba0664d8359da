//! Lifecycle notifications.
//!
//! Every notification is a [`HookEvent`]; handlers are registered per
//! [`HookKind`] and run in registration order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{ConnectionState, ControlPlaneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeSubscribe,
    BeforeUnsubscribe,
    ReconnectAttempt,
    ReconnectFailed,
    SubscribeFailed,
    Subscription,
    Unsubscription,
    StatusChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    /// A join request for `channel` is about to be sent.
    BeforeSubscribe { channel: String },
    /// A leave request for `channel` is about to be sent.
    BeforeUnsubscribe { channel: String },
    /// Reconnect attempt `attempt` (1-based) has been scheduled.
    ReconnectAttempt { attempt: u32 },
    /// Reconnect attempts are exhausted; the client is closed.
    ReconnectFailed,
    SubscribeFailed {
        channel: String,
        error: ControlPlaneError,
    },
    /// The server confirmed a join for `channel`.
    Subscription { channel: String },
    /// A handler was removed from `channel`, or the channel was deleted.
    Unsubscription { channel: String },
    StatusChange { status: ConnectionState },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::BeforeSubscribe { .. } => HookKind::BeforeSubscribe,
            HookEvent::BeforeUnsubscribe { .. } => HookKind::BeforeUnsubscribe,
            HookEvent::ReconnectAttempt { .. } => HookKind::ReconnectAttempt,
            HookEvent::ReconnectFailed => HookKind::ReconnectFailed,
            HookEvent::SubscribeFailed { .. } => HookKind::SubscribeFailed,
            HookEvent::Subscription { .. } => HookKind::Subscription,
            HookEvent::Unsubscription { .. } => HookKind::Unsubscription,
            HookEvent::StatusChange { .. } => HookKind::StatusChange,
        }
    }
}

pub type HookHandler = Arc<dyn Fn(&HookEvent) + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    handlers: RwLock<HashMap<HookKind, Vec<HookHandler>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: HookKind, handler: F) -> &Self
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn emit(&self, event: &HookEvent) {
        let kind = event.kind();
        // Snapshot so handlers may register further hooks without deadlocking.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if !run_isolated(|| handler(event)) {
                tracing::warn!(hook = ?kind, "hook handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&HookKind, usize> = handlers.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("Hooks").field("handlers", &counts).finish()
    }
}

/// Run a user callback, containing any panic. Returns `false` if it panicked.
pub(crate) fn run_isolated(f: impl FnOnce()) -> bool {
    catch_unwind(AssertUnwindSafe(f)).is_ok()
}
