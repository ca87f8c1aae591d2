//! Unified error type for Tether.

use tether_protocol::ProtocolError;
use tether_session::{IdentityError, SessionError};
use tether_transport::{ConnectionId, SendError, TransportError};

use crate::ConfigError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` facade you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attributes let `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Listen or connect failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A send was refused. Nothing was transmitted.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Application data may only go to authenticated peers.
    #[error("peer {0} is not authenticated")]
    PeerNotAuthenticated(ConnectionId),

    /// The client has not finished the handshake.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The host task is gone, so the request could not be delivered.
    #[error("host is not running")]
    HostStopped,
}
