//! `ServerHost` builder and host loop.
//!
//! The host is an actor: one task owns the transport, the registry and the
//! authenticator, and everything that can change them arrives through a
//! single queue. Four producers feed that queue:
//!
//! - the transport dispatcher (peer connected, data, disconnected)
//! - the identity service, through the installed [`ValidationSink`]
//! - timer tasks (validation timeout, grace disconnect)
//! - [`ServerHandle`]s held by the application

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_events::{EventDispatcher, SubscriptionId};
use tether_protocol::{Codec, Frame, Identity, JsonCodec};
use tether_pump::PumpScheduler;
use tether_session::{
    AuthState, ConnectionRegistry, IdentityError, PeerSession, RejectReason,
    ServerAction, ServerAuthenticator, ServerListing, TicketValidator,
    ValidationOutcome, ValidationSink,
};
use tether_transport::{
    Channel, ConnectionId, Link, SendError, ServerTransport,
    ServerTransportEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::{ServerConfig, TetherError};

/// What the server host tells the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer connected. It cannot exchange application data until it is
    /// authenticated.
    PeerConnected(ConnectionId),
    /// The identity service vouched for the peer.
    Authenticated {
        handle: ConnectionId,
        identity: Identity,
    },
    /// The peer was turned away and will be disconnected after the grace
    /// delay.
    Rejected {
        handle: ConnectionId,
        identity: Identity,
        reason: RejectReason,
    },
    /// Application data from an authenticated peer.
    Message {
        handle: ConnectionId,
        channel: Channel,
        data: Vec<u8>,
    },
    PeerDisconnected(ConnectionId),
    Error { handle: ConnectionId, cause: String },
}

/// A snapshot of one peer, as returned by [`ServerHandle::peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub handle: ConnectionId,
    pub identity: Option<Identity>,
    pub state: AuthState,
    pub connected_at: Instant,
    /// Where the peer connects from, if the link can tell.
    pub address: Option<String>,
}

impl PeerInfo {
    fn new(peer: &PeerSession, address: Option<String>) -> Self {
        Self {
            handle: peer.handle(),
            identity: peer.identity(),
            state: peer.auth_state(),
            connected_at: peer.connected_at(),
            address,
        }
    }
}

/// Everything the host task reacts to.
enum Input {
    Transport(ServerTransportEvent),
    Validation(ValidationOutcome),
    ValidationTimeout(ConnectionId),
    GraceExpired(ConnectionId),
    Command(Command),
}

/// Requests from a [`ServerHandle`]. The `oneshot::Sender` is the reply
/// channel.
enum Command {
    Send {
        handle: ConnectionId,
        channel: Channel,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TetherError>>,
    },
    SendMany {
        handles: Vec<ConnectionId>,
        channel: Channel,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, TetherError>>,
    },
    Disconnect {
        handle: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Stop,
}

/// Handle to a running [`ServerHost`].
///
/// Cheap to clone. Every call fails with [`TetherError::HostStopped`] once
/// the host task has exited.
#[derive(Clone)]
pub struct ServerHandle {
    inbox: mpsc::UnboundedSender<Input>,
}

impl ServerHandle {
    /// Sends application data to an authenticated peer.
    ///
    /// # Errors
    /// - [`TetherError::Send`] if the payload is too large for the channel
    ///   or the peer is unknown; nothing is sent
    /// - [`TetherError::PeerNotAuthenticated`] if the peer has not finished the
    ///   handshake
    pub async fn send(
        &self,
        handle: ConnectionId,
        channel: Channel,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            handle,
            channel,
            data: data.into(),
            reply,
        })?;
        rx.await.map_err(|_| TetherError::HostStopped)?
    }

    /// Sends the same data to several peers and returns how many got it.
    ///
    /// Peers that are unknown or not yet authenticated are skipped.
    ///
    /// # Errors
    /// [`TetherError::Send`] if the payload is too large for the channel;
    /// nothing is sent to anyone.
    pub async fn send_many(
        &self,
        handles: &[ConnectionId],
        channel: Channel,
        data: impl Into<Vec<u8>>,
    ) -> Result<usize, TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendMany {
            handles: handles.to_vec(),
            channel,
            data: data.into(),
            reply,
        })?;
        rx.await.map_err(|_| TetherError::HostStopped)?
    }

    /// Flushes and closes one peer. Returns `false` if it was not connected.
    pub async fn disconnect(
        &self,
        handle: ConnectionId,
    ) -> Result<bool, TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { handle, reply })?;
        rx.await.map_err(|_| TetherError::HostStopped)
    }

    /// Every registered peer, in connection order.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Peers { reply })?;
        rx.await.map_err(|_| TetherError::HostStopped)
    }

    /// Asks the host to disconnect everyone and exit its loop.
    pub fn stop(&self) -> Result<(), TetherError> {
        self.command(Command::Stop)
    }

    fn command(&self, command: Command) -> Result<(), TetherError> {
        self.inbox
            .send(Input::Command(command))
            .map_err(|_| TetherError::HostStopped)
    }
}

/// Builder for configuring a [`ServerHost`].
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let mut server = ServerHostBuilder::new()
///     .server_name("EU-1")
///     .port(27015)
///     .build(WebSocketLink::new(), my_validator)?;
/// server.listen()?;
/// server.run().await
/// ```
pub struct ServerHostBuilder {
    config: ServerConfig,
}

impl ServerHostBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.transport.port = port;
        self
    }

    /// Builds a host speaking JSON frames over `link`.
    ///
    /// # Errors
    /// [`TetherError::Config`] if the configuration does not validate.
    pub fn build<L: Link, V: TicketValidator>(
        self,
        link: L,
        validator: V,
    ) -> Result<ServerHost<L, V>, TetherError> {
        self.build_with_codec(link, validator, JsonCodec)
    }

    /// Builds a host with a custom frame codec.
    pub fn build_with_codec<L: Link, V: TicketValidator, C: Codec>(
        self,
        link: L,
        validator: V,
        codec: C,
    ) -> Result<ServerHost<L, V, C>, TetherError> {
        self.config.validate()?;
        let (sender, inbox) = mpsc::unbounded_channel();

        let transport_events = Arc::new(EventDispatcher::new());
        let tx = sender.clone();
        let forward = transport_events.subscribe(move |event: &ServerTransportEvent| {
            let _ = tx.send(Input::Transport(event.clone()));
        });
        let transport = ServerTransport::new(
            link,
            self.config.transport.clone(),
            transport_events,
        );

        let validator = Arc::new(validator);
        let tx = sender.clone();
        validator.install(ValidationSink::new(move |outcome| {
            let _ = tx.send(Input::Validation(outcome));
        }));

        Ok(ServerHost {
            auth: ServerAuthenticator::new(
                Arc::clone(&validator),
                self.config.auth.clone(),
            ),
            validator,
            pump: PumpScheduler::new(self.config.pump.clone()),
            config: self.config,
            transport,
            registry: ConnectionRegistry::new(),
            codec,
            events: Arc::new(EventDispatcher::new()),
            inbox,
            sender,
            timers: HashMap::new(),
            forward,
        })
    }
}

impl Default for ServerHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The server side of Tether: accepts peers, authenticates them and relays
/// application data for the authenticated ones.
///
/// Call [`listen`](Self::listen), subscribe to [`events`](Self::events),
/// keep a [`handle`](Self::handle), then [`run`](Self::run).
pub struct ServerHost<L: Link, V: TicketValidator, C: Codec = JsonCodec> {
    config: ServerConfig,
    transport: ServerTransport<L>,
    registry: ConnectionRegistry,
    auth: ServerAuthenticator<V>,
    validator: Arc<V>,
    codec: C,
    pump: PumpScheduler,
    events: Arc<EventDispatcher<ServerEvent>>,
    inbox: mpsc::UnboundedReceiver<Input>,
    sender: mpsc::UnboundedSender<Input>,
    /// Pending timer tasks per peer, aborted when the peer goes away.
    timers: HashMap<ConnectionId, Vec<AbortHandle>>,
    forward: SubscriptionId,
}

impl<L: Link, V: TicketValidator, C: Codec> ServerHost<L, V, C> {
    /// Starts accepting peers on the configured port (or relay id) and
    /// advertises the server to the identity service.
    ///
    /// # Errors
    /// - [`TetherError::Identity`] if the identity service is unavailable
    /// - [`TetherError::Transport`] if the link cannot listen
    pub fn listen(&mut self) -> Result<(), TetherError> {
        if !self.validator.is_available() {
            return Err(IdentityError::ServiceUnavailable(
                "identity service is not available".into(),
            )
            .into());
        }
        self.transport.listen(self.config.transport.port)?;
        self.validator.advertise(&ServerListing {
            name: self.config.server_name.clone(),
            max_peers: self.config.transport.max_peers,
            port: self.config.transport.port,
        });
        tracing::info!(
            server_name = %self.config.server_name,
            max_peers = self.config.transport.max_peers,
            "accepting players"
        );
        Ok(())
    }

    /// Whether both the link and the identity service can be used.
    pub fn is_available(&self) -> bool {
        self.transport.is_available() && self.validator.is_available()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inbox: self.sender.clone(),
        }
    }

    /// The application-facing dispatcher.
    pub fn events(&self) -> &Arc<EventDispatcher<ServerEvent>> {
        &self.events
    }

    pub fn transport(&self) -> &ServerTransport<L> {
        &self.transport
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs the host loop until [`ServerHandle::stop`] is called.
    ///
    /// While no peer is connected the loop sleeps on the link's activity
    /// signal; while any is, it pumps the transport at the configured rate.
    pub async fn run(mut self) -> Result<(), TetherError> {
        let activity = self.transport.activity();
        tracing::info!(server_name = %self.config.server_name, "server host running");

        loop {
            tokio::select! {
                input = self.inbox.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle_input(input) {
                        break;
                    }
                }
                _ = activity.notified(), if self.pump.is_idle() => {
                    self.transport.pump();
                }
                _ = self.pump.wait_for_pump() => {
                    let drained = self.transport.pump();
                    self.pump.record_pump_end(drained);
                }
            }

            if self.transport.is_live() {
                self.pump.wake();
            } else {
                self.pump.idle();
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Returns `false` when the loop should exit.
    fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Transport(event) => self.on_transport_event(event),
            Input::Validation(outcome) => {
                let actions = self.auth.on_validation(&mut self.registry, outcome);
                self.apply(actions);
            }
            Input::ValidationTimeout(handle) => {
                let actions =
                    self.auth.on_validation_timeout(&mut self.registry, handle);
                self.apply(actions);
            }
            Input::GraceExpired(handle) => {
                if self.transport.disconnect_peer(handle) {
                    tracing::info!(%handle, "rejected peer disconnected");
                }
            }
            Input::Command(Command::Send {
                handle,
                channel,
                data,
                reply,
            }) => {
                let _ = reply.send(self.send_app(handle, channel, data));
            }
            Input::Command(Command::SendMany {
                handles,
                channel,
                data,
                reply,
            }) => {
                let _ = reply.send(self.send_many(&handles, channel, data));
            }
            Input::Command(Command::Disconnect { handle, reply }) => {
                let _ = reply.send(self.transport.disconnect_peer(handle));
            }
            Input::Command(Command::Peers { reply }) => {
                let peers = self
                    .registry
                    .iter()
                    .map(|peer| {
                        PeerInfo::new(peer, self.transport.peer_address(peer.handle()))
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Input::Command(Command::Stop) => return false,
        }
        true
    }

    fn on_transport_event(&mut self, event: ServerTransportEvent) {
        match event {
            ServerTransportEvent::Connected(handle) => {
                let Some(link) = self.transport.link_id(handle) else {
                    tracing::debug!(%handle, "peer left before it was registered");
                    return;
                };
                if let Err(e) = self.auth.on_connected(&mut self.registry, handle, link) {
                    tracing::error!(%handle, error = %e, "could not register peer");
                    return;
                }
                tracing::info!(%handle, peers = self.registry.len(), "peer connected");
                self.events.publish(&ServerEvent::PeerConnected(handle));
            }
            ServerTransportEvent::Disconnected(handle) => {
                let actions = self.auth.on_disconnected(&mut self.registry, handle);
                if actions.is_empty() {
                    return;
                }
                self.apply(actions);
                tracing::info!(%handle, peers = self.registry.len(), "peer disconnected");
                self.events.publish(&ServerEvent::PeerDisconnected(handle));
            }
            ServerTransportEvent::DataReceived {
                handle,
                channel,
                data,
            } => self.on_data(handle, channel, &data),
            ServerTransportEvent::Error { handle, cause } => {
                self.events.publish(&ServerEvent::Error { handle, cause });
            }
        }
    }

    fn on_data(&mut self, handle: ConnectionId, channel: Channel, data: &[u8]) {
        let frame = match Frame::decode(&self.codec, data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%handle, error = %e, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::Auth(message) => {
                let actions =
                    self.auth.on_auth_message(&mut self.registry, handle, message);
                self.apply(actions);
            }
            Frame::App(data) => {
                let authenticated = self
                    .registry
                    .get(handle)
                    .is_some_and(PeerSession::is_authenticated);
                if authenticated {
                    self.events.publish(&ServerEvent::Message {
                        handle,
                        channel,
                        data,
                    });
                } else {
                    tracing::debug!(%handle, "dropping app frame from unauthenticated peer");
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Respond { handle, status } => {
                    let frame = Frame::auth_response(status);
                    if let Err(e) = self.send_frame(handle, Channel::Reliable, &frame) {
                        tracing::warn!(%handle, error = %e, "could not send auth response");
                    }
                }
                ServerAction::Authenticated { handle, identity } => {
                    self.events
                        .publish(&ServerEvent::Authenticated { handle, identity });
                }
                ServerAction::Rejected {
                    handle,
                    identity,
                    reason,
                } => {
                    self.events.publish(&ServerEvent::Rejected {
                        handle,
                        identity,
                        reason,
                    });
                }
                ServerAction::StartValidationTimer { handle, after } => {
                    self.start_timer(handle, after, Input::ValidationTimeout(handle));
                }
                ServerAction::ScheduleDisconnect { handle, after } => {
                    self.start_timer(handle, after, Input::GraceExpired(handle));
                }
                ServerAction::CancelTimers { handle } => {
                    for timer in self.timers.remove(&handle).unwrap_or_default() {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn send_app(
        &mut self,
        handle: ConnectionId,
        channel: Channel,
        data: Vec<u8>,
    ) -> Result<(), TetherError> {
        channel.check_payload(data.len())?;
        match self.registry.get(handle) {
            None => return Err(SendError::UnknownPeer(handle).into()),
            Some(peer) if !peer.is_authenticated() => {
                return Err(TetherError::PeerNotAuthenticated(handle));
            }
            Some(_) => {}
        }
        self.send_frame(handle, channel, &Frame::App(data))
    }

    fn send_many(
        &mut self,
        handles: &[ConnectionId],
        channel: Channel,
        data: Vec<u8>,
    ) -> Result<usize, TetherError> {
        channel.check_payload(data.len())?;
        let frame = Frame::App(data);
        let mut delivered = 0;
        for &handle in handles {
            if !self
                .registry
                .get(handle)
                .is_some_and(PeerSession::is_authenticated)
            {
                tracing::debug!(%handle, "skipping peer that is not authenticated");
                continue;
            }
            match self.send_frame(handle, channel, &frame) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(%handle, error = %e, "send to peer failed"),
            }
        }
        Ok(delivered)
    }

    fn send_frame(
        &mut self,
        handle: ConnectionId,
        channel: Channel,
        frame: &Frame,
    ) -> Result<(), TetherError> {
        let body = frame.encode_body(&self.codec)?;
        self.transport
            .send_tagged(handle, channel, frame.tag(), &body)?;
        Ok(())
    }

    fn start_timer(&mut self, handle: ConnectionId, after: Duration, fire: Input) {
        let inbox = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(fire);
        });
        self.timers
            .entry(handle)
            .or_default()
            .push(task.abort_handle());
    }

    fn shutdown(&mut self) {
        self.transport.stop_listening();
        // Only the disconnects matter now; queued commands are dropped and
        // their callers see `HostStopped`.
        while let Ok(input) = self.inbox.try_recv() {
            match input {
                Input::Transport(event @ ServerTransportEvent::Disconnected(_)) => {
                    self.on_transport_event(event);
                }
                Input::Validation(outcome) => {
                    tracing::debug!(
                        identity = %outcome.identity,
                        status = %outcome.status,
                        "dropping validation outcome during shutdown"
                    );
                }
                _ => {}
            }
        }
        for timer in self.timers.drain().flat_map(|(_, timers)| timers) {
            timer.abort();
        }
        self.transport.events().unsubscribe(self.forward);
        tracing::info!(server_name = %self.config.server_name, "server host stopped");
    }
}
