//! # Tether
//!
//! Authenticated session layer for multiplayer game transports.
//!
//! Tether multiplexes a point-to-point or relayed link into logical
//! connections and admits a peer to the application only after a
//! third-party identity service has vouched for it. The application sees
//! two small actors:
//!
//! - [`ServerHost`]: listens, runs the ticket handshake for every peer,
//!   and publishes [`ServerEvent`]s
//! - [`ClientHost`]: connects, fetches a ticket, proves its identity, and
//!   publishes [`ClientEvent`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! // Implement TicketValidator for your identity service, then:
//! // let mut server = ServerHostBuilder::new()
//! //     .config(ServerConfig::load("server.toml")?)
//! //     .build(WebSocketLink::new(), my_validator)?;
//! // server.events().subscribe(|event| println!("{event:?}"));
//! // server.listen()?;
//! // server.run().await
//! ```

mod client;
mod config;
mod error;
mod server;
pub mod telemetry;

pub use client::{ClientEvent, ClientHandle, ClientHost, ClientHostBuilder};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use error::TetherError;
pub use server::{PeerInfo, ServerEvent, ServerHandle, ServerHost, ServerHostBuilder};

pub use tether_events as events;
pub use tether_protocol as protocol;
pub use tether_pump as pump;
pub use tether_session as session;
pub use tether_transport as transport;

/// Everything needed to run a host.
pub mod prelude {
    pub use crate::{
        ClientConfig, ClientEvent, ClientHandle, ClientHost, ClientHostBuilder,
        ConfigError, PeerInfo, ServerConfig, ServerEvent, ServerHandle,
        ServerHost, ServerHostBuilder, TetherError,
    };
    pub use tether_events::{EventDispatcher, SubscriptionId};
    pub use tether_protocol::{AuthStatus, Identity};
    pub use tether_session::{
        AuthConfig, AuthFailure, AuthState, AuthTicket, ClientAuthState,
        IdentityError, RejectReason, ServerListing, TicketProvider,
        TicketValidator, ValidationOutcome, ValidationSink, ValidationStatus,
    };
    #[cfg(feature = "websocket")]
    pub use tether_transport::WebSocketLink;
    pub use tether_transport::{
        Channel, ConnectMode, ConnectionId, MemoryLink, MemoryNetwork,
        RelayId, SendError, TransportConfig,
    };
}
