use crate::{Channel, ConnectionId};

/// Errors from transport lifecycle operations (listen, connect).
///
/// These are the "transport-fatal" failures: they are returned
/// synchronously to whoever called `listen` or `connect` and are never
/// retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// The outbound connection could not be started.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// `connect` was called while a connection is already live or pending.
    #[error("already connected")]
    AlreadyConnected,

    /// `listen` was called on a session that is already listening.
    #[error("already listening")]
    AlreadyListening,

    /// The link implementation cannot route to relay identifiers.
    #[error("relay endpoints are not supported by this link")]
    RelayUnsupported,

    /// A relay-mode session was built without the relay id it needs.
    #[error("relay mode requires {0} to be configured")]
    MissingRelayId(&'static str),

    /// The link reports that its socket layer is not usable.
    #[error("link unavailable")]
    Unavailable,

    /// The link needs an async runtime and none is running.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

/// Why a `send` was refused.
///
/// A refused send never transmits partial data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The channel id is not one of the known [`Channel`]s.
    /// This is a programming error, not a transient failure.
    #[error("unsupported channel id {0}")]
    UnsupportedChannel(u8),

    /// The payload is larger than the channel allows.
    #[error("payload of {size} bytes exceeds {channel} limit of {max}")]
    PayloadTooLarge {
        channel: Channel,
        size: usize,
        max: usize,
    },

    /// The link is not established.
    #[error("not connected")]
    NotConnected,

    /// No live peer has this handle.
    #[error("unknown peer {0}")]
    UnknownPeer(ConnectionId),

    /// The link accepted the call but could not queue the data.
    #[error("link refused data: {0}")]
    Link(String),
}
