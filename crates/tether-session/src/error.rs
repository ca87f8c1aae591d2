//! Error types for the session layer.

use tether_protocol::Identity;
use tether_transport::{ConnectionId, LinkId};

use crate::AuthState;

/// Errors from registry and peer-state bookkeeping.
///
/// These indicate a caller bug (a handle registered twice, a state machine
/// driven backwards), never a remote peer misbehaving: remote misbehavior
/// is answered with a rejection, not an error value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A peer with this handle is already registered.
    #[error("handle {0} is already registered")]
    DuplicateHandle(ConnectionId),

    /// The link connection already belongs to another peer.
    #[error("{link} is already registered as {owner}")]
    DuplicateLink { link: LinkId, owner: ConnectionId },

    /// The peer already has an identity; identities are set once.
    #[error("{handle} already has identity {identity}")]
    IdentityAlreadySet {
        handle: ConnectionId,
        identity: Identity,
    },

    /// The auth state machine only moves forward.
    #[error("{handle} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        handle: ConnectionId,
        from: AuthState,
        to: AuthState,
    },
}

/// Failures reported synchronously by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The client could not obtain a ticket.
    #[error("ticket unavailable: {0}")]
    TicketUnavailable(String),

    /// The service is not running or refused to take the request.
    #[error("identity service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service rejected the ticket before validating it.
    #[error("invalid ticket: {0}")]
    InvalidTicket(String),
}
