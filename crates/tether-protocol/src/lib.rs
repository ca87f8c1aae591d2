//! Wire protocol for Tether.
//!
//! Defines what travels inside a transport payload:
//!
//! - **Types** ([`Frame`], [`AuthMessage`], [`Identity`], [`AuthStatus`]):
//!   the handshake messages and the application passthrough.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how handshake messages
//!   become bytes. A frame is one tag byte followed by either a
//!   codec-encoded [`AuthMessage`] or the raw application payload.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer knows nothing about connections or channels. It only
//! turns frames into bytes and back, and checks the few rules a decoded
//! message must still satisfy.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Session (peer state)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{AuthMessage, AuthStatus, Frame, Identity, MAX_TICKET_LEN};
