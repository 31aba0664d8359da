//! Resilient client for Transmit-style server push channels.
//!
//! Messages arrive over one long-lived server-sent events stream at
//! `<base>/__transmit/events`; channels are joined and left with
//! `POST <base>/__transmit/subscribe` and `POST <base>/__transmit/unsubscribe`.
//!
//! # Features
//! - Automatic reconnection with fixed or exponential backoff
//! - Heartbeat-based dead-connection detection
//! - Channel subscriptions re-joined after every reconnect
//! - One join request per channel, however many callers subscribe concurrently
//! - Lifecycle hooks for status changes, subscribes, and reconnects
//! - Pluggable transport and control plane
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), transmit_client::Error> {
//! use transmit_client::{ConnectionState, Transmit, TransmitConfig};
//!
//! let client = Transmit::connect(TransmitConfig::new("https://example.com"))?;
//! client.on(ConnectionState::Reconnecting, || println!("reconnecting"));
//!
//! let id = client
//!     .subscribe("users/1", |payload| println!("got: {payload}"))
//!     .await?;
//!
//! client.unsubscribe("users/1", id, Some(true)).await?;
//! client.close();
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod control_plane;
mod heartbeat;
mod hooks;
mod protocol;
mod registry;
mod transport;
mod types;

pub use client::{Transmit, TransmitBuilder};
pub use config::{Backoff, TransmitConfig};
pub use control_plane::{ControlPlane, ControlPlaneFactory, HttpControlPlane};
pub use hooks::{HookEvent, HookHandler, HookKind, Hooks};
pub use protocol::{Frame, HEARTBEAT_CHANNEL};
pub use registry::Subscription;
pub use transport::{SseTransportFactory, Transport, TransportEvent, TransportFactory};
pub use types::{
    ClientSession, ConnectionState, ControlPlaneError, CredentialProvider, Error, HandlerId,
    MessageHandler, NoCredentials, Result, SubscriptionStatus, UidProvider, XsrfToken, random_uid,
};
