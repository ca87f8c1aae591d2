//! Peer sessions and the ticket-authentication handshake for Tether.
//!
//! This crate owns everything between "a connection exists" and "the
//! application may trust it":
//!
//! 1. **Peer tracking**: [`ConnectionRegistry`] holds a [`PeerSession`]
//!    per live connection, with its asserted identity and [`AuthState`]
//! 2. **Identity service seams**: [`TicketProvider`] (client) and
//!    [`TicketValidator`] (server), implemented by whatever platform
//!    service issues tickets
//! 3. **Handshake logic**: [`ServerAuthenticator`] and
//!    [`ClientAuthenticator`], sans-IO state machines that return the
//!    actions a host must perform
//!
//! # How it fits in the stack
//!
//! ```text
//! Hosts (above)   ← own transport + registry, execute actions
//!     ↕
//! Session layer (this crate)   ← decides what each event means
//!     ↕
//! Protocol layer (below)   ← Identity, AuthMessage, AuthStatus
//! ```

mod client_auth;
mod config;
mod error;
mod identity;
mod peer;
mod registry;
mod server_auth;

pub use client_auth::{
    AuthFailure, ClientAction, ClientAuthState, ClientAuthenticator,
};
pub use config::AuthConfig;
pub use error::{IdentityError, SessionError};
pub use identity::{
    AuthTicket, ServerListing, TicketProvider, TicketValidator,
    ValidationOutcome, ValidationSink, ValidationStatus,
};
pub use peer::{AuthState, PeerSession};
pub use registry::ConnectionRegistry;
pub use server_auth::{RejectReason, ServerAction, ServerAuthenticator};
