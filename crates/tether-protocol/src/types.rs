//! Wire types for the Tether handshake.
//!
//! Everything a Tether peer puts on a transport channel is a [`Frame`]:
//! either a handshake message ([`AuthMessage`]) or an opaque application
//! payload that the session layer passes through untouched.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::{Codec, ProtocolError};

/// Longest ticket an [`AuthMessage::AuthRequest`] may carry, in bytes.
pub const MAX_TICKET_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The identity a peer asserts, as issued by the identity service.
///
/// Serialized as a plain number: `Identity(42)` is `42` on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// AuthStatus
// ---------------------------------------------------------------------------

/// Result code carried by [`AuthMessage::AuthResponse`].
///
/// Written as an integer (`0` success, `1` failure) so clients in other
/// languages can read it without knowing the variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum AuthStatus {
    Ok = 0,
    Failed = 1,
}

impl AuthStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl From<AuthStatus> for u8 {
    fn from(status: AuthStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for AuthStatus {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Failed),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown auth status {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMessage
// ---------------------------------------------------------------------------

/// The two handshake messages. Both travel on the reliable channel.
///
/// Internally tagged, so a request looks like
/// `{"type":"AuthRequest","identity":42,"ticket":[97,98,99]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthMessage {
    /// Client → server: "I am `identity`, here is my proof."
    AuthRequest { identity: Identity, ticket: Vec<u8> },

    /// Server → client: the verdict.
    AuthResponse { status: AuthStatus },
}

impl AuthMessage {
    /// Checks protocol rules that deserialization alone cannot.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidMessage`] if a request's ticket is empty or
    /// longer than [`MAX_TICKET_LEN`].
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Self::AuthRequest { identity, ticket } = self {
            if ticket.is_empty() {
                return Err(ProtocolError::InvalidMessage(format!(
                    "empty ticket from {identity}"
                )));
            }
            if ticket.len() > MAX_TICKET_LEN {
                return Err(ProtocolError::InvalidMessage(format!(
                    "ticket of {} bytes from {identity} exceeds {MAX_TICKET_LEN}",
                    ticket.len()
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One transport payload: a tag byte followed by a body.
///
/// | tag | body |
/// |-----|------|
/// | [`Frame::AUTH_TAG`] | an [`AuthMessage`], encoded with the host's [`Codec`] |
/// | [`Frame::APP_TAG`] | application bytes, exactly as the caller gave them |
///
/// Application data never goes through the codec, so a payload costs its
/// own length plus one byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Auth(AuthMessage),
    App(Vec<u8>),
}

impl Frame {
    pub const AUTH_TAG: u8 = 0;
    pub const APP_TAG: u8 = 1;

    pub fn auth_request(identity: Identity, ticket: Vec<u8>) -> Self {
        Self::Auth(AuthMessage::AuthRequest { identity, ticket })
    }

    pub fn auth_response(status: AuthStatus) -> Self {
        Self::Auth(AuthMessage::AuthResponse { status })
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Auth(_) => Self::AUTH_TAG,
            Self::App(_) => Self::APP_TAG,
        }
    }

    /// The bytes that follow the tag. Application payloads are borrowed.
    ///
    /// # Errors
    /// Whatever the codec reports for an auth message.
    pub fn encode_body<C: Codec>(
        &self,
        codec: &C,
    ) -> Result<Cow<'_, [u8]>, ProtocolError> {
        match self {
            Self::Auth(message) => Ok(Cow::Owned(codec.encode(message)?)),
            Self::App(data) => Ok(Cow::Borrowed(data)),
        }
    }

    /// Tag and body in one buffer.
    pub fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, ProtocolError> {
        let body = self.encode_body(codec)?;
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(self.tag());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Parses a received message.
    ///
    /// # Errors
    /// - [`ProtocolError::InvalidMessage`] for an empty message or an
    ///   unknown tag
    /// - the codec's error if an auth body does not decode
    pub fn decode<C: Codec>(codec: &C, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::InvalidMessage("empty frame".into()))?;
        match tag {
            Self::AUTH_TAG => Ok(Self::Auth(codec.decode(body)?)),
            Self::APP_TAG => Ok(Self::App(body.to_vec())),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown frame tag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // Identity
    // =====================================================================

    #[test]
    fn test_identity_serializes_as_plain_number() {
        let json = serde_json::to_string(&Identity(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity(42).to_string(), "ID-42");
    }

    // =====================================================================
    // AuthStatus
    // =====================================================================

    #[test]
    fn test_auth_status_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&AuthStatus::Ok).unwrap(), "0");
        assert_eq!(serde_json::to_string(&AuthStatus::Failed).unwrap(), "1");
    }

    #[test]
    fn test_auth_status_unknown_code_fails_to_decode() {
        let result: Result<AuthStatus, _> = serde_json::from_str("7");
        assert!(result.is_err());
    }

    // =====================================================================
    // AuthMessage
    // =====================================================================

    #[test]
    fn test_auth_request_json_format() {
        let msg = AuthMessage::AuthRequest {
            identity: Identity(42),
            ticket: b"abc".to_vec(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "AuthRequest");
        assert_eq!(json["identity"], 42);
        assert_eq!(json["ticket"], serde_json::json!([97, 98, 99]));
    }

    #[test]
    fn test_auth_response_json_format() {
        let msg = AuthMessage::AuthResponse {
            status: AuthStatus::Failed,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"AuthResponse","status":1}"#);
    }

    #[test]
    fn test_validate_accepts_ticket_at_limit() {
        let msg = AuthMessage::AuthRequest {
            identity: Identity(1),
            ticket: vec![0; MAX_TICKET_LEN],
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_ticket() {
        let msg = AuthMessage::AuthRequest {
            identity: Identity(1),
            ticket: Vec::new(),
        };
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_ticket() {
        let msg = AuthMessage::AuthRequest {
            identity: Identity(1),
            ticket: vec![0; MAX_TICKET_LEN + 1],
        };
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_validate_response_always_ok() {
        let msg = AuthMessage::AuthResponse {
            status: AuthStatus::Ok,
        };
        assert!(msg.validate().is_ok());
    }
}
