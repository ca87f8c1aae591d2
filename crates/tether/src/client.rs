//! `ClientHost` builder and host loop.
//!
//! Same actor shape as the server host. The extra producer here is the
//! ticket task: ticket acquisition may take a while, so it runs on its own
//! task and posts the result back into the queue, keeping every send
//! serialized with the rest of the transport work.

use std::sync::Arc;

use tether_events::{EventDispatcher, SubscriptionId};
use tether_protocol::{Codec, Frame, Identity, JsonCodec};
use tether_pump::PumpScheduler;
use tether_session::{
    AuthFailure, AuthTicket, ClientAction, ClientAuthState, ClientAuthenticator,
    IdentityError, TicketProvider,
};
use tether_transport::{Channel, ClientTransport, ClientTransportEvent, Link};
use tokio::sync::{mpsc, oneshot};

use crate::{ClientConfig, TetherError};

/// What the client host tells the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport connected; the handshake starts now.
    Connected,
    /// The server accepted our identity.
    Authenticated { identity: Identity },
    /// The handshake failed. A disconnect follows unless the connection is
    /// already gone.
    AuthFailed { reason: AuthFailure },
    /// Application data from the server.
    Message { channel: Channel, data: Vec<u8> },
    Disconnected,
    /// A failed connect attempt, or a problem on the live connection.
    Error { cause: String },
}

enum Input {
    Transport(ClientTransportEvent),
    Ticket {
        attempt: u64,
        result: Result<AuthTicket, IdentityError>,
    },
    Command(Command),
}

enum Command {
    Connect {
        host: String,
        reply: oneshot::Sender<Result<(), TetherError>>,
    },
    Send {
        channel: Channel,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TetherError>>,
    },
    Disconnect,
    State {
        reply: oneshot::Sender<ClientAuthState>,
    },
    Stop,
}

/// Handle to a running [`ClientHost`]. Cheap to clone.
#[derive(Clone)]
pub struct ClientHandle {
    inbox: mpsc::UnboundedSender<Input>,
}

impl ClientHandle {
    /// Starts connecting to `host`. The outcome arrives as
    /// [`ClientEvent::Connected`] or [`ClientEvent::Error`].
    pub async fn connect(&self, host: &str) -> Result<(), TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            host: host.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| TetherError::HostStopped)?
    }

    /// Sends application data to the server.
    ///
    /// # Errors
    /// - [`TetherError::Send`] if the payload is too large for the channel
    ///   or there is no connection; nothing is sent
    /// - [`TetherError::NotAuthenticated`] before the handshake completes
    pub async fn send(
        &self,
        channel: Channel,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            channel,
            data: data.into(),
            reply,
        })?;
        rx.await.map_err(|_| TetherError::HostStopped)?
    }

    /// Closes the connection. Idempotent.
    pub fn disconnect(&self) -> Result<(), TetherError> {
        self.command(Command::Disconnect)
    }

    /// Where the handshake currently stands.
    pub async fn auth_state(&self) -> Result<ClientAuthState, TetherError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::State { reply })?;
        rx.await.map_err(|_| TetherError::HostStopped)
    }

    pub fn stop(&self) -> Result<(), TetherError> {
        self.command(Command::Stop)
    }

    fn command(&self, command: Command) -> Result<(), TetherError> {
        self.inbox
            .send(Input::Command(command))
            .map_err(|_| TetherError::HostStopped)
    }
}

/// Builder for configuring a [`ClientHost`].
pub struct ClientHostBuilder {
    config: ClientConfig,
}

impl ClientHostBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.transport.port = port;
        self
    }

    /// Builds a host speaking JSON frames over `link`.
    pub fn build<L: Link, P: TicketProvider>(
        self,
        link: L,
        provider: P,
    ) -> Result<ClientHost<L, P>, TetherError> {
        self.build_with_codec(link, provider, JsonCodec)
    }

    pub fn build_with_codec<L: Link, P: TicketProvider, C: Codec>(
        self,
        link: L,
        provider: P,
        codec: C,
    ) -> Result<ClientHost<L, P, C>, TetherError> {
        self.config.validate()?;
        let (sender, inbox) = mpsc::unbounded_channel();

        let transport_events = Arc::new(EventDispatcher::new());
        let tx = sender.clone();
        let forward = transport_events.subscribe(move |event: &ClientTransportEvent| {
            let _ = tx.send(Input::Transport(event.clone()));
        });

        Ok(ClientHost {
            transport: ClientTransport::new(
                link,
                self.config.transport.clone(),
                transport_events,
            ),
            pump: PumpScheduler::new(self.config.pump.clone()),
            config: self.config,
            auth: ClientAuthenticator::new(),
            provider: Arc::new(provider),
            codec,
            events: Arc::new(EventDispatcher::new()),
            inbox,
            sender,
            forward,
        })
    }
}

impl Default for ClientHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The client side of Tether: one connection to one server, authenticated
/// with a ticket from the local identity service.
pub struct ClientHost<L: Link, P: TicketProvider, C: Codec = JsonCodec> {
    config: ClientConfig,
    transport: ClientTransport<L>,
    auth: ClientAuthenticator,
    provider: Arc<P>,
    codec: C,
    pump: PumpScheduler,
    events: Arc<EventDispatcher<ClientEvent>>,
    inbox: mpsc::UnboundedReceiver<Input>,
    sender: mpsc::UnboundedSender<Input>,
    forward: SubscriptionId,
}

impl<L: Link, P: TicketProvider, C: Codec> ClientHost<L, P, C> {
    /// Starts connecting before the loop runs. Same as
    /// [`ClientHandle::connect`].
    ///
    /// # Errors
    /// - [`TetherError::Identity`] if the identity service is unavailable
    /// - [`TetherError::Transport`] if the link cannot connect
    pub fn connect(&mut self, host: &str) -> Result<(), TetherError> {
        if !self.provider.is_available() {
            return Err(IdentityError::ServiceUnavailable(
                "identity service is not available".into(),
            )
            .into());
        }
        self.transport.connect(host)?;
        Ok(())
    }

    /// Whether both the link and the identity service can be used.
    pub fn is_available(&self) -> bool {
        self.transport.is_available() && self.provider.is_available()
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            inbox: self.sender.clone(),
        }
    }

    pub fn events(&self) -> &Arc<EventDispatcher<ClientEvent>> {
        &self.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs the host loop until [`ClientHandle::stop`] is called.
    pub async fn run(mut self) -> Result<(), TetherError> {
        let activity = self.transport.activity();
        tracing::debug!("client host running");

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

    fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Transport(event) => self.on_transport_event(event),
            Input::Ticket { attempt, result } => {
                let actions = self.auth.on_ticket(attempt, result);
                self.apply(actions);
            }
            Input::Command(Command::Connect { host, reply }) => {
                let _ = reply.send(self.connect(&host));
            }
            Input::Command(Command::Send {
                channel,
                data,
                reply,
            }) => {
                let _ = reply.send(self.send_app(channel, data));
            }
            Input::Command(Command::Disconnect) => self.transport.disconnect(),
            Input::Command(Command::State { reply }) => {
                let _ = reply.send(self.auth.state());
            }
            Input::Command(Command::Stop) => return false,
        }
        true
    }

    fn on_transport_event(&mut self, event: ClientTransportEvent) {
        match event {
            ClientTransportEvent::Connected => {
                self.events.publish(&ClientEvent::Connected);
                let actions = self.auth.on_connected();
                self.apply(actions);
            }
            ClientTransportEvent::Disconnected => {
                let actions = self.auth.on_disconnected();
                self.apply(actions);
                self.events.publish(&ClientEvent::Disconnected);
            }
            ClientTransportEvent::DataReceived { channel, data } => {
                let frame = match Frame::decode(&self.codec, &data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping undecodable frame");
                        return;
                    }
                };
                match frame {
                    Frame::Auth(message) => {
                        let actions = self.auth.on_auth_message(message);
                        self.apply(actions);
                    }
                    Frame::App(data) if self.auth.is_authenticated() => {
                        self.events.publish(&ClientEvent::Message { channel, data });
                    }
                    Frame::App(_) => {
                        tracing::debug!("dropping app frame received before authentication");
                    }
                }
            }
            ClientTransportEvent::Error { cause } => {
                self.events.publish(&ClientEvent::Error { cause });
            }
        }
    }

    fn apply(&mut self, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::AcquireTicket { attempt } => {
                    let provider = Arc::clone(&self.provider);
                    let inbox = self.sender.clone();
                    tokio::spawn(async move {
                        let result = provider.acquire_ticket().await;
                        let _ = inbox.send(Input::Ticket { attempt, result });
                    });
                }
                ClientAction::Send(message) => {
                    let frame = Frame::Auth(message);
                    if let Err(e) = self.send_frame(Channel::Reliable, &frame) {
                        // Without the request the server never answers.
                        tracing::warn!(error = %e, "could not send auth request");
                        self.transport.disconnect();
                    }
                }
                ClientAction::Authenticated { identity } => {
                    self.events.publish(&ClientEvent::Authenticated { identity });
                }
                ClientAction::AuthFailed { reason } => {
                    self.events.publish(&ClientEvent::AuthFailed { reason });
                }
                ClientAction::Disconnect => self.transport.disconnect(),
            }
        }
    }

    fn send_app(&mut self, channel: Channel, data: Vec<u8>) -> Result<(), TetherError> {
        channel.check_payload(data.len())?;
        if self.transport.is_live() && !self.auth.is_authenticated() {
            return Err(TetherError::NotAuthenticated);
        }
        self.send_frame(channel, &Frame::App(data))
    }

    fn send_frame(&mut self, channel: Channel, frame: &Frame) -> Result<(), TetherError> {
        let body = frame.encode_body(&self.codec)?;
        self.transport.send_tagged(channel, frame.tag(), &body)?;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.transport.disconnect();
        while let Ok(input) = self.inbox.try_recv() {
            match input {
                Input::Transport(event @ ClientTransportEvent::Disconnected) => {
                    self.on_transport_event(event);
                }
                Input::Ticket { attempt, .. } => {
                    tracing::debug!(attempt, "dropping ticket during shutdown");
                }
                _ => {}
            }
        }
        self.transport.events().unsubscribe(self.forward);
        tracing::debug!("client host stopped");
    }
}
