//! Transport layer for Tether.
//!
//! Multiplexes an underlying point-to-point (or relayed) link into logical
//! connections with channel-based delivery:
//!
//! - [`Link`]: the low-level, poll-driven socket collaborator
//! - [`ServerTransport`] / [`ClientTransport`]: the transport sessions that
//!   own links, assign handles, enforce channel limits and publish events
//!   on an [`EventDispatcher`](tether_events::EventDispatcher)
//! - [`MemoryNetwork`]: an in-process link for tests and local play
//! - `WebSocketLink`: a direct-mode link over `tokio-tungstenite`
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket link via `tokio-tungstenite`

mod channel;
mod config;
mod error;
mod memory;
mod session;
#[cfg(feature = "websocket")]
mod websocket;

pub use channel::Channel;
pub use config::{ConnectMode, TransportConfig};
pub use error::{SendError, TransportError};
pub use memory::{MemoryLink, MemoryNetwork};
pub use session::{
    ClientTransport, ClientTransportEvent, ServerTransport,
    ServerTransportEvent,
};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketLink;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Process-local handle for one live connection.
///
/// Handles are assigned monotonically on accept and never reused, so a
/// stale handle can never name a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque reference to one underlying link connection.
///
/// Owned by the transport session; the layers above only ever see
/// [`ConnectionId`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Creates a new `LinkId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// A relay-routable peer identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RelayId(pub u64);

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay-{}", self.0)
    }
}

/// Where a link listens or connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A network address and port.
    Direct(SocketAddr),
    /// A peer reachable through the relay network.
    Relay(RelayId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(addr) => write!(f, "{addr}"),
            Self::Relay(id) => write!(f, "{id}"),
        }
    }
}

/// Something a link observed since the last [`Link::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection is established (accepted, or our connect completed).
    Connected(LinkId),
    /// The connection is gone. Also reported when a connect attempt fails.
    Disconnected(LinkId),
    /// A complete message arrived.
    Message {
        link: LinkId,
        channel: Channel,
        data: Vec<u8>,
    },
    /// The link hit a problem on this connection.
    Error { link: LinkId, cause: String },
}

/// The underlying socket layer.
///
/// Links are poll-driven: nothing is surfaced until [`poll`](Self::poll)
/// drains the queue. Every method is synchronous and must return quickly;
/// implementations that need I/O do it on background tasks and queue the
/// results.
pub trait Link: Send + 'static {
    /// Starts accepting connections on `endpoint`.
    fn listen(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Stops accepting. Existing connections are left alone.
    fn stop_listening(&mut self);

    /// Starts an outbound connection. The outcome is reported later as
    /// [`LinkEvent::Connected`] or [`LinkEvent::Disconnected`].
    fn connect(&mut self, endpoint: &Endpoint) -> Result<LinkId, TransportError>;

    /// Queues `data` for delivery. The bytes are copied before returning.
    ///
    /// Callers never pass more than [`Channel::max_message`] bytes.
    fn send(
        &mut self,
        link: LinkId,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), SendError>;

    /// Pushes out anything still buffered for `link`, best-effort.
    fn flush(&mut self, link: LinkId);

    /// Closes `link`. The remote side observes a disconnect; the local
    /// side does not get a [`LinkEvent::Disconnected`] for it.
    fn close(&mut self, link: LinkId);

    /// Moves every queued event into `out`, in arrival order.
    fn poll(&mut self, out: &mut Vec<LinkEvent>);

    /// Signalled whenever new events are queued.
    fn activity(&self) -> Arc<Notify>;

    /// A printable address or name for the remote end of `link`, if the
    /// link knows one.
    fn peer_address(&self, link: LinkId) -> Option<String> {
        let _ = link;
        None
    }

    /// Whether the underlying socket layer can be used right now. A link
    /// backed by an external service reports `false` while that service is
    /// down.
    fn is_available(&self) -> bool {
        true
    }
}
