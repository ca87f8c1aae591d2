//! Transport sessions.
//!
//! A session owns one [`Link`] and turns its raw [`LinkEvent`]s into
//! handle-addressed events on an [`EventDispatcher`]. Sessions are plain
//! single-owner values: whoever holds one calls [`pump`](ServerTransport::pump)
//! to move data, and nothing happens in between.

use std::collections::HashMap;
use std::sync::Arc;

use tether_events::EventDispatcher;
use tokio::sync::Notify;

use crate::{
    Channel, ConnectionId, Link, LinkEvent, LinkId, SendError,
    TransportConfig, TransportError,
};

/// What a [`ServerTransport`] publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTransportEvent {
    /// A peer connected and was assigned `handle`.
    Connected(ConnectionId),
    /// The peer is gone. Published at most once per handle.
    Disconnected(ConnectionId),
    /// A message arrived from a peer.
    DataReceived {
        handle: ConnectionId,
        channel: Channel,
        data: Vec<u8>,
    },
    /// The link reported a problem with a peer.
    Error { handle: ConnectionId, cause: String },
}

/// What a [`ClientTransport`] publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransportEvent {
    Connected,
    Disconnected,
    DataReceived { channel: Channel, data: Vec<u8> },
    /// A failed connect attempt, or a problem on the live connection.
    Error { cause: String },
}

/// Server side of the transport.
///
/// Assigns a fresh [`ConnectionId`] to every accepted link connection and
/// keeps the two id spaces apart; callers address peers by handle only.
pub struct ServerTransport<L: Link> {
    link: L,
    config: TransportConfig,
    events: Arc<EventDispatcher<ServerTransportEvent>>,
    listening: bool,
    next_handle: u64,
    by_link: HashMap<LinkId, ConnectionId>,
    by_handle: HashMap<ConnectionId, LinkId>,
    scratch: Vec<LinkEvent>,
}

impl<L: Link> ServerTransport<L> {
    pub fn new(
        link: L,
        config: TransportConfig,
        events: Arc<EventDispatcher<ServerTransportEvent>>,
    ) -> Self {
        Self {
            link,
            config,
            events,
            listening: false,
            next_handle: 0,
            by_link: HashMap::new(),
            by_handle: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    /// Starts accepting peers on `port` (or on the configured relay id).
    ///
    /// # Errors
    /// [`TransportError::AlreadyListening`] on a second call, or whatever the
    /// link reports for the bind.
    pub fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        if self.listening {
            return Err(TransportError::AlreadyListening);
        }
        if !self.link.is_available() {
            return Err(TransportError::Unavailable);
        }
        let endpoint = self.config.listen_endpoint(port)?;
        self.link.listen(&endpoint)?;
        self.listening = true;
        tracing::info!(%endpoint, mode = ?self.config.mode, "server listening");
        Ok(())
    }

    /// Stops accepting and disconnects every live peer.
    ///
    /// A `Disconnected` event is published for each peer, in handle order.
    pub fn stop_listening(&mut self) {
        if self.listening {
            self.link.stop_listening();
            self.listening = false;
        }
        let mut handles: Vec<ConnectionId> =
            self.by_handle.keys().copied().collect();
        handles.sort();
        for handle in handles {
            self.disconnect_peer(handle);
        }
        tracing::info!("server stopped listening");
    }

    /// Sends `data` to one peer.
    ///
    /// The payload is checked against the channel limit first; a refused
    /// send transmits nothing.
    pub fn send(
        &mut self,
        handle: ConnectionId,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), SendError> {
        channel.check_payload(data.len())?;
        let link = *self
            .by_handle
            .get(&handle)
            .ok_or(SendError::UnknownPeer(handle))?;
        self.link.send(link, channel, data)
    }

    /// Sends `tag` followed by `payload` to one peer.
    ///
    /// Only `payload` is checked against the channel limit; the receiver
    /// sees the tag as the first byte of the message.
    pub fn send_tagged(
        &mut self,
        handle: ConnectionId,
        channel: Channel,
        tag: u8,
        payload: &[u8],
    ) -> Result<(), SendError> {
        channel.check_payload(payload.len())?;
        let link = *self
            .by_handle
            .get(&handle)
            .ok_or(SendError::UnknownPeer(handle))?;
        self.link.send(link, channel, &tagged(tag, payload))
    }

    /// Flushes and closes one peer, then publishes `Disconnected`.
    ///
    /// Returns `false` (and does nothing) if the handle is not live, so
    /// calling it twice is harmless.
    pub fn disconnect_peer(&mut self, handle: ConnectionId) -> bool {
        let Some(link) = self.by_handle.remove(&handle) else {
            return false;
        };
        self.by_link.remove(&link);
        self.link.flush(link);
        self.link.close(link);
        tracing::debug!(%handle, "peer disconnected locally");
        self.events.publish(&ServerTransportEvent::Disconnected(handle));
        true
    }

    /// Drains the link and publishes what it saw. Returns the number of
    /// link events processed.
    pub fn pump(&mut self) -> usize {
        let mut batch = std::mem::take(&mut self.scratch);
        self.link.poll(&mut batch);
        let count = batch.len();
        for event in batch.drain(..) {
            self.handle_link_event(event);
        }
        self.scratch = batch;
        count
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(link) => {
                if let Some(handle) = self.by_link.get(&link) {
                    tracing::warn!(%link, %handle, "link reported connected twice, ignoring");
                    return;
                }
                if self.by_handle.len() >= self.config.max_peers {
                    tracing::warn!(
                        %link,
                        max_peers = self.config.max_peers,
                        "server full, refusing connection"
                    );
                    self.link.close(link);
                    return;
                }
                self.next_handle += 1;
                let handle = ConnectionId::new(self.next_handle);
                self.by_link.insert(link, handle);
                self.by_handle.insert(handle, link);
                tracing::debug!(%handle, %link, "peer connected");
                self.events.publish(&ServerTransportEvent::Connected(handle));
            }
            LinkEvent::Disconnected(link) => {
                if let Some(handle) = self.by_link.remove(&link) {
                    self.by_handle.remove(&handle);
                    tracing::debug!(%handle, "peer disconnected remotely");
                    self.events
                        .publish(&ServerTransportEvent::Disconnected(handle));
                }
            }
            LinkEvent::Message {
                link,
                channel,
                data,
            } => match self.by_link.get(&link) {
                Some(&handle) => {
                    self.events.publish(&ServerTransportEvent::DataReceived {
                        handle,
                        channel,
                        data,
                    });
                }
                None => {
                    tracing::trace!(%link, "dropping message for unknown link");
                }
            },
            LinkEvent::Error { link, cause } => match self.by_link.get(&link) {
                Some(&handle) => {
                    tracing::warn!(%handle, %cause, "transport error");
                    self.events
                        .publish(&ServerTransportEvent::Error { handle, cause });
                }
                None => {
                    tracing::debug!(%link, %cause, "error on unknown link");
                }
            },
        }
    }

    /// Whether at least one peer is connected.
    pub fn is_live(&self) -> bool {
        !self.by_handle.is_empty()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn peer_count(&self) -> usize {
        self.by_handle.len()
    }

    /// The link-level id behind `handle`, for diagnostics.
    pub fn link_id(&self, handle: ConnectionId) -> Option<LinkId> {
        self.by_handle.get(&handle).copied()
    }

    /// Where the peer behind `handle` connects from, as the link names it.
    pub fn peer_address(&self, handle: ConnectionId) -> Option<String> {
        let link = self.by_handle.get(&handle)?;
        self.link.peer_address(*link)
    }

    /// Whether the link can be used right now.
    pub fn is_available(&self) -> bool {
        self.link.is_available()
    }

    /// Live handles, ascending.
    pub fn handles(&self) -> Vec<ConnectionId> {
        let mut handles: Vec<_> = self.by_handle.keys().copied().collect();
        handles.sort();
        handles
    }

    /// The link's wake-up signal.
    pub fn activity(&self) -> Arc<Notify> {
        self.link.activity()
    }

    pub fn events(&self) -> &Arc<EventDispatcher<ServerTransportEvent>> {
        &self.events
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting(LinkId),
    Connected(LinkId),
}

/// Client side of the transport: at most one connection at a time.
pub struct ClientTransport<L: Link> {
    link: L,
    config: TransportConfig,
    events: Arc<EventDispatcher<ClientTransportEvent>>,
    state: ClientState,
    scratch: Vec<LinkEvent>,
}

impl<L: Link> ClientTransport<L> {
    pub fn new(
        link: L,
        config: TransportConfig,
        events: Arc<EventDispatcher<ClientTransportEvent>>,
    ) -> Self {
        Self {
            link,
            config,
            events,
            state: ClientState::Idle,
            scratch: Vec::new(),
        }
    }

    /// Starts connecting to `host` on the configured port, or to the
    /// configured relay target in relay mode.
    ///
    /// Returns as soon as the attempt is started; the outcome is published
    /// as `Connected` or `Error`.
    pub fn connect(&mut self, host: &str) -> Result<(), TransportError> {
        if self.state != ClientState::Idle {
            return Err(TransportError::AlreadyConnected);
        }
        if !self.link.is_available() {
            return Err(TransportError::Unavailable);
        }
        let endpoint = self.config.connect_endpoint(host)?;
        let link = self.link.connect(&endpoint)?;
        self.state = ClientState::Connecting(link);
        tracing::info!(%endpoint, "connecting");
        Ok(())
    }

    /// Sends `data` to the server.
    pub fn send(&mut self, channel: Channel, data: &[u8]) -> Result<(), SendError> {
        channel.check_payload(data.len())?;
        match self.state {
            ClientState::Connected(link) => self.link.send(link, channel, data),
            _ => Err(SendError::NotConnected),
        }
    }

    /// Sends `tag` followed by `payload` to the server. Only `payload`
    /// counts against the channel limit.
    pub fn send_tagged(
        &mut self,
        channel: Channel,
        tag: u8,
        payload: &[u8],
    ) -> Result<(), SendError> {
        channel.check_payload(payload.len())?;
        match self.state {
            ClientState::Connected(link) => {
                self.link.send(link, channel, &tagged(tag, payload))
            }
            _ => Err(SendError::NotConnected),
        }
    }

    /// Flushes and closes the connection.
    ///
    /// Publishes `Disconnected` only if a connection was established.
    /// Abandoning a pending attempt publishes nothing. Idempotent.
    pub fn disconnect(&mut self) {
        match std::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Idle => {}
            ClientState::Connecting(link) => {
                self.link.close(link);
                tracing::debug!(%link, "connect attempt abandoned");
            }
            ClientState::Connected(link) => {
                self.link.flush(link);
                self.link.close(link);
                tracing::info!("disconnected");
                self.events.publish(&ClientTransportEvent::Disconnected);
            }
        }
    }

    /// Drains the link and publishes what it saw.
    pub fn pump(&mut self) -> usize {
        let mut batch = std::mem::take(&mut self.scratch);
        self.link.poll(&mut batch);
        let count = batch.len();
        for event in batch.drain(..) {
            self.handle_link_event(event);
        }
        self.scratch = batch;
        count
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match (self.state, event) {
            (ClientState::Connecting(ours), LinkEvent::Connected(link))
                if ours == link =>
            {
                self.state = ClientState::Connected(link);
                tracing::info!("connected");
                self.events.publish(&ClientTransportEvent::Connected);
            }
            (ClientState::Connecting(ours), LinkEvent::Error { link, cause })
                if ours == link =>
            {
                self.state = ClientState::Idle;
                self.link.close(link);
                tracing::warn!(%cause, "connect failed");
                self.events.publish(&ClientTransportEvent::Error { cause });
            }
            (ClientState::Connecting(ours), LinkEvent::Disconnected(link))
                if ours == link =>
            {
                self.state = ClientState::Idle;
                let cause = "connection closed before it was established";
                tracing::warn!(cause, "connect failed");
                self.events.publish(&ClientTransportEvent::Error {
                    cause: cause.to_owned(),
                });
            }
            (ClientState::Connected(ours), LinkEvent::Disconnected(link))
                if ours == link =>
            {
                self.state = ClientState::Idle;
                tracing::info!("connection closed by remote");
                self.events.publish(&ClientTransportEvent::Disconnected);
            }
            (
                ClientState::Connected(ours),
                LinkEvent::Message {
                    link,
                    channel,
                    data,
                },
            ) if ours == link => {
                self.events
                    .publish(&ClientTransportEvent::DataReceived { channel, data });
            }
            (ClientState::Connected(ours), LinkEvent::Error { link, cause })
                if ours == link =>
            {
                tracing::warn!(%cause, "transport error");
                self.events.publish(&ClientTransportEvent::Error { cause });
            }
            (_, stale) => {
                tracing::trace!(?stale, "ignoring event for a stale link");
            }
        }
    }

    /// Whether the connection is established.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ClientState::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, ClientState::Connecting(_))
    }

    /// Whether the link can be used right now.
    pub fn is_available(&self) -> bool {
        self.link.is_available()
    }

    pub fn activity(&self) -> Arc<Notify> {
        self.link.activity()
    }

    pub fn events(&self) -> &Arc<EventDispatcher<ClientTransportEvent>> {
        &self.events
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(Channel::TAG_LEN + payload.len());
    message.push(tag);
    message.extend_from_slice(payload);
    message
}
