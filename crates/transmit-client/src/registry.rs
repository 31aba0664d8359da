//! Channel subscriptions: message handlers, join serialization, and replay
//! after reconnection.
//!
//! At most one join request per channel is in flight at any time. The
//! channel's entry in `join_locks` is the lock: whoever inserts it issues the
//! request (or queues it until the connection opens), everyone else parks a
//! oneshot in it and receives the shared outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::control_plane::ControlPlane;
use crate::hooks::{HookEvent, Hooks, run_isolated};
use crate::types::{
    ConnectionState, ControlPlaneError, Error, HandlerId, MessageHandler, Result,
    SubscriptionStatus,
};

type JoinResult = std::result::Result<(), ControlPlaneError>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HandlerEntry {
    id: HandlerId,
    once: bool,
    handler: MessageHandler,
}

/// Interest in one channel: its status and handlers in insertion order.
pub(crate) struct SubscriptionEntry {
    channel: String,
    status: Mutex<SubscriptionStatus>,
    handlers: Mutex<Vec<HandlerEntry>>,
}

impl SubscriptionEntry {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            status: Mutex::new(SubscriptionStatus::Pending),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: SubscriptionStatus) {
        *lock(&self.status) = status;
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Remove a handler; returns how many remain, or `None` if it was not registered.
    fn remove_handler(&self, id: HandlerId) -> Option<usize> {
        let mut handlers = lock(&self.handlers);
        let index = handlers.iter().position(|entry| entry.id == id)?;
        handlers.remove(index);
        Some(handlers.len())
    }

    fn run_handlers(&self, payload: &serde_json::Value) {
        // Handlers run without the lock so they may add or remove handlers.
        let snapshot: Vec<(HandlerId, bool, MessageHandler)> = lock(&self.handlers)
            .iter()
            .map(|entry| (entry.id, entry.once, Arc::clone(&entry.handler)))
            .collect();
        for (id, once, handler) in snapshot {
            if once && self.remove_handler(id).is_none() {
                continue;
            }
            if !run_isolated(|| handler(payload)) {
                tracing::warn!(channel = %self.channel, "message handler panicked");
            }
        }
    }
}

/// A join in flight or queued for one channel.
#[derive(Default)]
struct JoinLock {
    waiters: Vec<oneshot::Sender<JoinResult>>,
    /// A connection opened while the join was in flight; join once more when it settles.
    rejoin: bool,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<String, Arc<SubscriptionEntry>>,
    join_locks: HashMap<String, JoinLock>,
    /// Joins waiting for the connection to open.
    deferred: Vec<Arc<SubscriptionEntry>>,
    closed: bool,
}

pub(crate) struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    control: Arc<dyn ControlPlane>,
    hooks: Arc<Hooks>,
    status: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    next_handler_id: AtomicU64,
    leave_on_last_handler: bool,
}

impl SubscriptionRegistry {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        hooks: Arc<Hooks>,
        status: watch::Receiver<ConnectionState>,
        shutdown: CancellationToken,
        leave_on_last_handler: bool,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            control,
            hooks,
            status,
            shutdown,
            next_handler_id: AtomicU64::new(1),
            leave_on_last_handler,
        }
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionState::Connected
    }

    pub fn get(&self, channel: &str) -> Option<Arc<SubscriptionEntry>> {
        lock(&self.state).subscriptions.get(channel).cloned()
    }

    /// The channel's subscription, registering a `Pending` one if there is none.
    /// Once closed, a detached entry is returned and nothing is registered.
    pub fn subscription(&self, channel: &str) -> Arc<SubscriptionEntry> {
        let mut state = lock(&self.state);
        if state.closed {
            return Arc::new(SubscriptionEntry::new(channel));
        }
        Arc::clone(
            state
                .subscriptions
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(SubscriptionEntry::new(channel))),
        )
    }

    pub fn add_handler(
        &self,
        entry: &SubscriptionEntry,
        handler: MessageHandler,
        once: bool,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        lock(&entry.handlers).push(HandlerEntry { id, once, handler });
        id
    }

    /// Join the entry's channel unless it is already created.
    ///
    /// Concurrent calls for one channel share a single join request. While the
    /// connection is not open the request is queued and issued by
    /// [`on_connected`](Self::on_connected).
    pub async fn join(self: &Arc<Self>, entry: &Arc<SubscriptionEntry>) -> Result<()> {
        let channel = entry.channel.clone();
        let rx = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Error::Closed);
            }
            match entry.status() {
                SubscriptionStatus::Created => return Ok(()),
                SubscriptionStatus::Deleted => return Err(Error::SubscriptionDeleted(channel)),
                SubscriptionStatus::Pending => {}
            }
            let registered = state
                .subscriptions
                .get(&channel)
                .map(|current| Arc::ptr_eq(current, entry));
            match registered {
                Some(true) => {}
                Some(false) => return Err(Error::StaleSubscription(channel)),
                // Discarded after a failed join; the caller asks again.
                None => {
                    state.subscriptions.insert(channel.clone(), Arc::clone(entry));
                }
            }

            let (tx, rx) = oneshot::channel();
            if let Some(join_lock) = state.join_locks.get_mut(&channel) {
                join_lock.waiters.push(tx);
            } else {
                state.join_locks.insert(
                    channel.clone(),
                    JoinLock {
                        waiters: vec![tx],
                        rejoin: false,
                    },
                );
                if self.is_connected() {
                    self.spawn_join(Arc::clone(entry), false);
                } else {
                    tracing::debug!(channel, "deferring join until connected");
                    state.deferred.push(Arc::clone(entry));
                }
            }
            rx
        };

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(Error::SubscribeFailed { channel, source }),
            Err(_) => Err(Error::Closed),
        }
    }

    fn spawn_join(self: &Arc<Self>, entry: Arc<SubscriptionEntry>, replay: bool) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.hooks.emit(&HookEvent::BeforeSubscribe {
                channel: entry.channel.clone(),
            });
            let result = tokio::select! {
                _ = registry.shutdown.cancelled() => return,
                result = registry.control.join(&entry.channel) => result,
            };
            registry.finish_join(&entry, result, replay);
        });
    }

    fn finish_join(
        self: &Arc<Self>,
        entry: &Arc<SubscriptionEntry>,
        result: JoinResult,
        replay: bool,
    ) {
        let channel = entry.channel.as_str();
        let (waiters, rejoin) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let join_lock = state.join_locks.remove(channel).unwrap_or_default();
            match result {
                Ok(()) => {
                    if entry.status() == SubscriptionStatus::Pending {
                        entry.set_status(SubscriptionStatus::Created);
                    }
                }
                Err(_) if !replay => {
                    if state
                        .subscriptions
                        .get(channel)
                        .is_some_and(|current| Arc::ptr_eq(current, entry))
                    {
                        state.subscriptions.remove(channel);
                    }
                }
                // A failed replay keeps the subscription; the next reconnect retries it.
                Err(_) => {}
            }
            let rejoin = join_lock.rejoin && entry.status() == SubscriptionStatus::Created;
            if rejoin {
                state
                    .join_locks
                    .insert(channel.to_string(), JoinLock::default());
            }
            (join_lock.waiters, rejoin)
        };

        match &result {
            Ok(()) => {
                tracing::info!(channel, replay, "subscribed");
                self.hooks.emit(&HookEvent::Subscription {
                    channel: channel.to_string(),
                });
            }
            Err(error) => {
                tracing::warn!(channel, replay, "subscribe failed: {error}");
                self.hooks.emit(&HookEvent::SubscribeFailed {
                    channel: channel.to_string(),
                    error: error.clone(),
                });
            }
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        if rejoin {
            tracing::debug!(channel, "rejoining for the newest connection");
            self.spawn_join(Arc::clone(entry), true);
        }
    }

    /// The connection opened: re-join every created channel and issue the
    /// joins queued while disconnected.
    pub fn on_connected(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        let RegistryState {
            subscriptions,
            join_locks,
            deferred,
            ..
        } = &mut *state;

        let mut replayed = 0usize;
        for entry in subscriptions.values() {
            if entry.status() != SubscriptionStatus::Created {
                continue;
            }
            if let Some(join_lock) = join_locks.get_mut(&entry.channel) {
                join_lock.rejoin = true;
                continue;
            }
            join_locks.insert(entry.channel.clone(), JoinLock::default());
            self.spawn_join(Arc::clone(entry), true);
            replayed += 1;
        }

        let queued = std::mem::take(deferred);
        let drained = queued.len();
        for entry in queued {
            self.spawn_join(entry, false);
        }
        tracing::debug!(replayed, drained, "issued joins after connect");
    }

    /// Run every handler of `channel`. A panicking handler does not stop the others.
    pub fn dispatch(&self, channel: &str, payload: &serde_json::Value) {
        let Some(entry) = self.get(channel) else {
            tracing::trace!(channel, "no subscription for channel, dropping message");
            return;
        };
        entry.run_handlers(payload);
    }

    /// Remove a handler. Once the last one is gone and `force_leave` (or the
    /// configured default) is set, the channel is left on the server.
    ///
    /// Returns `false` if the handler was not registered.
    pub async fn remove_handler(
        &self,
        entry: &Arc<SubscriptionEntry>,
        id: HandlerId,
        force_leave: Option<bool>,
    ) -> Result<bool> {
        let Some(remaining) = self.detach_handler(entry, id) else {
            return Ok(false);
        };
        if remaining == 0 && force_leave.unwrap_or(self.leave_on_last_handler) {
            self.leave(entry).await?;
        }
        Ok(true)
    }

    /// Remove a handler without ever leaving the channel.
    pub fn detach_handler(&self, entry: &SubscriptionEntry, id: HandlerId) -> Option<usize> {
        let remaining = entry.remove_handler(id)?;
        tracing::debug!(channel = %entry.channel, remaining, "handler removed");
        self.hooks.emit(&HookEvent::Unsubscription {
            channel: entry.channel.clone(),
        });
        Some(remaining)
    }

    /// Leave the channel on the server and notify observers.
    pub async fn delete(&self, entry: &Arc<SubscriptionEntry>) -> Result<()> {
        if self.leave(entry).await? {
            self.hooks.emit(&HookEvent::Unsubscription {
                channel: entry.channel.clone(),
            });
        }
        Ok(())
    }

    /// Leave a created channel. Pending joins are never cancelled and deleted
    /// subscriptions stay deleted; both return `Ok(false)`.
    async fn leave(&self, entry: &Arc<SubscriptionEntry>) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if entry.status() != SubscriptionStatus::Created {
            return Ok(false);
        }

        let channel = entry.channel.as_str();
        self.hooks.emit(&HookEvent::BeforeUnsubscribe {
            channel: channel.to_string(),
        });
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::Closed),
            result = self.control.leave(channel) => result,
        };

        match result {
            Ok(()) => {
                let mut state = lock(&self.state);
                entry.set_status(SubscriptionStatus::Deleted);
                if state
                    .subscriptions
                    .get(channel)
                    .is_some_and(|current| Arc::ptr_eq(current, entry))
                {
                    state.subscriptions.remove(channel);
                }
                drop(state);
                tracing::info!(channel, "unsubscribed");
                Ok(true)
            }
            Err(source) => {
                tracing::warn!(channel, "unsubscribe failed: {source}");
                Err(Error::UnsubscribeFailed {
                    channel: channel.to_string(),
                    source,
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Drop queued joins and release every waiter with [`Error::Closed`].
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        let waiting = state.join_locks.len();
        state.join_locks.clear();
        state.deferred.clear();
        tracing::debug!(waiting, "subscription registry closed");
    }
}

/// Handle to the subscription of one channel.
///
/// Cloning the handle does not create a new subscription; all clones and all
/// handles obtained for the same channel share handlers and status.
#[derive(Clone)]
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    pub(crate) fn new(entry: Arc<SubscriptionEntry>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { entry, registry }
    }

    pub fn channel(&self) -> &str {
        &self.entry.channel
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.entry.status()
    }

    pub fn is_created(&self) -> bool {
        self.status() == SubscriptionStatus::Created
    }

    pub fn is_deleted(&self) -> bool {
        self.status() == SubscriptionStatus::Deleted
    }

    pub fn handler_count(&self) -> usize {
        self.entry.handler_count()
    }

    /// Register a handler for every message on the channel.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.registry.add_handler(&self.entry, Arc::new(handler), false)
    }

    /// Register a handler that is removed after its first message.
    pub fn on_message_once<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.registry.add_handler(&self.entry, Arc::new(handler), true)
    }

    /// Remove a handler locally. The channel stays joined even if it was the
    /// last one. Returns `false` if the handler was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.registry.detach_handler(&self.entry, id).is_some()
    }

    /// Remove a handler; see [`Transmit::unsubscribe`](crate::Transmit::unsubscribe).
    pub async fn unsubscribe(&self, id: HandlerId, force_leave: Option<bool>) -> Result<bool> {
        self.registry
            .remove_handler(&self.entry, id, force_leave)
            .await
    }

    /// Join the channel on the server. Resolves once the join is confirmed.
    pub async fn create(&self) -> Result<()> {
        self.registry.join(&self.entry).await
    }

    /// Leave the channel on the server. No-op unless the subscription is created.
    pub async fn delete(&self) -> Result<()> {
        self.registry.delete(&self.entry).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.entry.channel)
            .field("status", &self.entry.status())
            .field("handlers", &self.entry.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::hooks::HookKind;

    const JOIN_LATENCY: Duration = Duration::from_millis(100);

    #[derive(Default)]
    struct FakeControlPlane {
        joins: Mutex<Vec<String>>,
        leaves: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: Mutex<usize>,
    }

    impl FakeControlPlane {
        fn joins(&self) -> Vec<String> {
            self.joins.lock().unwrap().clone()
        }

        fn leaves(&self) -> Vec<String> {
            self.leaves.lock().unwrap().clone()
        }

        fn fail(&self, channel: &str) {
            self.failing.lock().unwrap().push(channel.to_string());
        }

        fn failing(&self, channel: &str) -> bool {
            self.failing.lock().unwrap().iter().any(|c| c == channel)
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn join(&self, channel: &str) -> std::result::Result<(), ControlPlaneError> {
            self.joins.lock().unwrap().push(channel.to_string());
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let count = in_flight.entry(channel.to_string()).or_default();
                *count += 1;
                let mut max = self.max_in_flight.lock().unwrap();
                *max = (*max).max(*count);
            }
            tokio::time::sleep(JOIN_LATENCY).await;
            if let Some(count) = self.in_flight.lock().unwrap().get_mut(channel) {
                *count -= 1;
            }
            if self.failing(channel) {
                return Err(ControlPlaneError::Status(500));
            }
            Ok(())
        }

        async fn leave(&self, channel: &str) -> std::result::Result<(), ControlPlaneError> {
            self.leaves.lock().unwrap().push(channel.to_string());
            if self.failing(channel) {
                return Err(ControlPlaneError::Status(500));
            }
            Ok(())
        }
    }

    struct Harness {
        control: Arc<FakeControlPlane>,
        registry: Arc<SubscriptionRegistry>,
        status: watch::Sender<ConnectionState>,
        events: Arc<Mutex<Vec<HookEvent>>>,
    }

    impl Harness {
        fn new(connected: bool) -> Self {
            Self::with_leave_default(connected, false)
        }

        fn with_leave_default(connected: bool, leave_on_last_handler: bool) -> Self {
            let control = Arc::new(FakeControlPlane::default());
            let hooks = Arc::new(Hooks::new());
            let events = Arc::new(Mutex::new(Vec::new()));
            for kind in [
                HookKind::BeforeSubscribe,
                HookKind::SubscribeFailed,
                HookKind::Subscription,
                HookKind::Unsubscription,
                HookKind::BeforeUnsubscribe,
            ] {
                let events = Arc::clone(&events);
                hooks.register(kind, move |event| events.lock().unwrap().push(event.clone()));
            }
            let initial = if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Connecting
            };
            let (status, status_rx) = watch::channel(initial);
            let registry = Arc::new(SubscriptionRegistry::new(
                Arc::clone(&control) as Arc<dyn ControlPlane>,
                hooks,
                status_rx,
                CancellationToken::new(),
                leave_on_last_handler,
            ));
            Self {
                control,
                registry,
                status,
                events,
            }
        }

        fn handle(&self, channel: &str) -> Subscription {
            Subscription::new(self.registry.subscription(channel), Arc::clone(&self.registry))
        }

        async fn subscribe(&self, channel: &str, seen: &Arc<Mutex<Vec<String>>>, tag: &str) -> Result<HandlerId> {
            let sub = self.handle(channel);
            let id = sub.on_message(recorder(seen, tag));
            sub.create().await?;
            Ok(id)
        }

        fn connect(&self) {
            self.status.send_replace(ConnectionState::Connected);
            self.registry.on_connected();
        }

        fn events(&self) -> Vec<HookEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    fn recorder(seen: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&serde_json::Value) + Send + Sync + 'static {
        let seen = Arc::clone(seen);
        let tag = tag.to_string();
        move |payload| seen.lock().unwrap().push(format!("{tag}:{payload}"))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_joins_and_marks_created() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        h.subscribe("orders", &seen, "a").await.unwrap();

        assert_eq!(h.control.joins(), vec!["orders"]);
        assert!(h.handle("orders").is_created());
        assert_eq!(
            h.events(),
            vec![
                HookEvent::BeforeSubscribe { channel: "orders".into() },
                HookEvent::Subscription { channel: "orders".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_subscribes_share_one_join() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (first, second) = tokio::join!(
            h.subscribe("orders", &seen, "a"),
            h.subscribe("orders", &seen, "b"),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(h.control.joins(), vec!["orders"]);
        h.registry.dispatch("orders", &serde_json::json!(1));
        assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn many_concurrent_subscribes_never_overlap_joins() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let calls: Vec<_> = (0..10)
            .map(|i| {
                let tag = format!("h{i}");
                let channel = if i % 2 == 0 { "even" } else { "odd" };
                let h = &h;
                let seen = &seen;
                async move { h.subscribe(channel, seen, &tag).await }
            })
            .collect();
        for result in futures_util::future::join_all(calls).await {
            result.unwrap();
        }

        let mut joins = h.control.joins();
        joins.sort();
        assert_eq!(joins, vec!["even", "odd"]);
        assert_eq!(*h.control.max_in_flight.lock().unwrap(), 1);
        assert_eq!(h.handle("even").handler_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn created_subscription_is_not_joined_again() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        h.subscribe("orders", &seen, "a").await.unwrap();
        h.subscribe("orders", &seen, "b").await.unwrap();

        assert_eq!(h.control.joins(), vec!["orders"]);
        assert_eq!(h.handle("orders").handler_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn join_waits_for_connection() {
        let h = Arc::new(Harness::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let h = Arc::clone(&h);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move { h.subscribe("orders", &seen, "a").await })
        };
        settle().await;
        assert!(h.control.joins().is_empty());
        assert_eq!(h.handle("orders").status(), SubscriptionStatus::Pending);

        h.connect();
        task.await.unwrap().unwrap();
        assert_eq!(h.control.joins(), vec!["orders"]);
        assert!(h.handle("orders").is_created());

        // The queue is drained once; a second open only replays.
        h.connect();
        settle().await;
        tokio::time::sleep(JOIN_LATENCY).await;
        assert_eq!(h.control.joins(), vec!["orders", "orders"]);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_rejoins_only_created_subscriptions() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        h.subscribe("created", &seen, "a").await.unwrap();
        h.handle("pending");
        h.subscribe("deleted", &seen, "b").await.unwrap();
        h.handle("deleted").delete().await.unwrap();
        let before = h.control.joins().len();

        h.connect();
        tokio::time::sleep(JOIN_LATENCY * 2).await;

        let replayed: Vec<String> = h.control.joins().into_iter().skip(before).collect();
        assert_eq!(replayed, vec!["created"]);
        assert!(h.handle("created").is_created());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_replay_rejoins_after_it_settles() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        h.subscribe("orders", &seen, "a").await.unwrap();

        h.connect();
        settle().await;
        h.connect();
        tokio::time::sleep(JOIN_LATENCY * 4).await;

        assert_eq!(h.control.joins(), vec!["orders", "orders", "orders"]);
        assert_eq!(*h.control.max_in_flight.lock().unwrap(), 1);
        assert!(h.handle("orders").is_created());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reconnects_queue_a_single_rejoin() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        h.subscribe("orders", &seen, "a").await.unwrap();

        h.connect();
        h.connect();
        h.connect();
        tokio::time::sleep(JOIN_LATENCY * 4).await;

        assert_eq!(h.control.joins(), vec!["orders", "orders", "orders"]);
        assert_eq!(*h.control.max_in_flight.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_discards_subscription() {
        let h = Harness::new(true);
        h.control.fail("orders");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let err = h.subscribe("orders", &seen, "a").await.unwrap_err();
        assert!(matches!(
            err,
            Error::SubscribeFailed {
                source: ControlPlaneError::Status(500),
                ..
            }
        ));
        assert!(h.registry.get("orders").is_none());
        assert!(h.events().contains(&HookEvent::SubscribeFailed {
            channel: "orders".into(),
            error: ControlPlaneError::Status(500),
        }));

        // Messages for the channel go nowhere.
        h.registry.dispatch("orders", &serde_json::json!(1));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_reaches_every_waiter() {
        let h = Harness::new(true);
        h.control.fail("orders");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (first, second) = tokio::join!(
            h.subscribe("orders", &seen, "a"),
            h.subscribe("orders", &seen, "b"),
        );
        assert!(matches!(first, Err(Error::SubscribeFailed { .. })));
        assert!(matches!(second, Err(Error::SubscribeFailed { .. })));
        assert_eq!(h.control.joins(), vec!["orders"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_after_failed_join() {
        let h = Harness::new(true);
        h.control.fail("orders");
        let stale = h.handle("orders");
        assert!(stale.create().await.is_err());

        let fresh = h.handle("orders");
        assert!(matches!(
            stale.create().await,
            Err(Error::StaleSubscription(_))
        ));
        assert_eq!(fresh.status(), SubscriptionStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_added_during_join_receives_messages() {
        let h = Arc::new(Harness::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let h = Arc::clone(&h);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move { h.subscribe("orders", &seen, "a").await })
        };
        settle().await;
        h.handle("orders").on_message(recorder(&seen, "late"));
        task.await.unwrap().unwrap();

        h.registry.dispatch("orders", &serde_json::json!("x"));
        assert_eq!(*seen.lock().unwrap(), vec![r#"a:"x""#, r#"late:"x""#]);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_last_handler_does_not_cancel_join() {
        let h = Arc::new(Harness::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = h.handle("orders");
        let id = sub.on_message(recorder(&seen, "a"));
        let task = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.create().await })
        };
        settle().await;

        assert!(sub.unsubscribe(id, Some(true)).await.unwrap());
        task.await.unwrap().unwrap();

        assert!(sub.is_created());
        assert_eq!(sub.handler_count(), 0);
        assert!(h.control.leaves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_isolates_panicking_handler() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = h.handle("x");
        sub.on_message(|_| panic!("handler failure"));
        sub.on_message(recorder(&seen, "h2"));

        h.registry.dispatch("x", &serde_json::json!(1));
        h.registry.dispatch("x", &serde_json::json!(2));

        assert_eq!(*seen.lock().unwrap(), vec!["h2:1", "h2:2"]);
        assert_eq!(sub.handler_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_to_unknown_channel_is_noop() {
        let h = Harness::new(true);
        h.registry.dispatch("nobody", &serde_json::json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn once_handler_runs_once() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = h.handle("x");
        sub.on_message_once(recorder(&seen, "once"));
        sub.on_message(recorder(&seen, "always"));

        h.registry.dispatch("x", &serde_json::json!(1));
        h.registry.dispatch("x", &serde_json::json!(2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["once:1", "always:1", "always:2"]
        );
        assert_eq!(sub.handler_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_last_handler_keeps_subscription_by_default() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = h.subscribe("orders", &seen, "a").await.unwrap();

        let sub = h.handle("orders");
        assert!(sub.unsubscribe(id, None).await.unwrap());

        assert!(h.control.leaves().is_empty());
        assert!(sub.is_created());
        assert!(h.events().contains(&HookEvent::Unsubscription {
            channel: "orders".into()
        }));
        // Unknown handler.
        assert!(!sub.unsubscribe(id, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn off_never_leaves() {
        let h = Harness::with_leave_default(true, true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = h.subscribe("orders", &seen, "a").await.unwrap();
        let sub = h.handle("orders");

        assert!(sub.off(id));
        assert!(!sub.off(id));
        assert!(h.control.leaves().is_empty());
        assert!(sub.is_created());
        assert_eq!(sub.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_default_leaves_on_last_handler() {
        let h = Harness::with_leave_default(true, true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = h.subscribe("orders", &seen, "a").await.unwrap();
        let second = h.subscribe("orders", &seen, "b").await.unwrap();
        let sub = h.handle("orders");

        sub.unsubscribe(first, None).await.unwrap();
        assert!(h.control.leaves().is_empty());

        sub.unsubscribe(second, None).await.unwrap();
        assert_eq!(h.control.leaves(), vec!["orders"]);
        assert!(sub.is_deleted());
    }

    #[tokio::test(start_paused = true)]
    async fn forced_leave_deletes_subscription() {
        let h = Harness::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = h.subscribe("orders", &seen, "a").await.unwrap();
        let sub = h.handle("orders");

        sub.unsubscribe(id, Some(true)).await.unwrap();

        assert_eq!(h.control.leaves(), vec!["orders"]);
        assert!(sub.is_deleted());
        assert!(h.registry.get("orders").is_none());
        assert!(matches!(
            sub.create().await,
            Err(Error::SubscriptionDeleted(_))
        ));

        // Rejoining needs a fresh subscription.
        let fresh = h.handle("orders");
        assert_eq!(fresh.status(), SubscriptionStatus::Pending);
        fresh.create().await.unwrap();
        assert_eq!(h.control.joins(), vec!["orders", "orders"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_only_leaves_created_subscriptions() {
        let h = Harness::new(true);
        let sub = h.handle("orders");

        sub.delete().await.unwrap();
        assert!(h.control.leaves().is_empty());

        sub.create().await.unwrap();
        sub.delete().await.unwrap();
        sub.delete().await.unwrap();
        assert_eq!(h.control.leaves(), vec!["orders"]);
        assert!(h.events().contains(&HookEvent::Unsubscription {
            channel: "orders".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_leave_keeps_subscription_created() {
        let h = Harness::new(true);
        let sub = h.handle("orders");
        sub.create().await.unwrap();
        h.control.fail("orders");

        let err = sub.delete().await.unwrap_err();
        assert!(matches!(err, Error::UnsubscribeFailed { .. }));
        assert!(sub.is_created());
        assert!(h.registry.get("orders").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_deferred_joins() {
        let h = Arc::new(Harness::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let h = Arc::clone(&h);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move { h.subscribe("orders", &seen, "a").await })
        };
        settle().await;

        h.registry.close();
        assert!(matches!(task.await.unwrap(), Err(Error::Closed)));

        h.connect();
        tokio::time::sleep(JOIN_LATENCY * 2).await;
        assert!(h.control.joins().is_empty());
        assert!(matches!(
            h.subscribe("other", &seen, "b").await,
            Err(Error::Closed)
        ));
        assert!(h.registry.get("other").is_none());
        assert_eq!(h.handle("other").handler_count(), 0);
    }
}
