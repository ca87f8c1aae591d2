//! Codec trait and implementations.
//!
//! A codec turns handshake messages into bytes and back. The hosts are
//! generic over [`Codec`], so a binary format can replace [`JsonCodec`]
//! without touching the session logic. Application payloads bypass the
//! codec entirely (see [`Frame`](crate::Frame)).

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because a codec lives inside a host task for the
/// whole life of the host.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value cannot be represented.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or do not
    /// match `T`.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] using JSON via `serde_json`.
///
/// Readable in packet captures and logs, at the cost of size.
///
/// ```rust
/// use tether_protocol::{AuthMessage, Codec, Identity, JsonCodec};
///
/// let codec = JsonCodec;
/// let request = AuthMessage::AuthRequest {
///     identity: Identity(42),
///     ticket: b"abc".to_vec(),
/// };
///
/// let bytes = codec.encode(&request).unwrap();
/// let decoded: AuthMessage = codec.decode(&bytes).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{AuthMessage, AuthStatus, Frame, Identity};

    #[test]
    fn test_decode_garbage_returns_decode_error() {
        let result: Result<AuthMessage, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_wrong_shape_returns_decode_error() {
        let result: Result<AuthMessage, _> = JsonCodec.decode(br#"{"name":"hello"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_request_from_other_implementation() {
        let bytes = br#"{"type":"AuthRequest","identity":7,"ticket":[1,2]}"#;
        let message: AuthMessage = JsonCodec.decode(bytes).unwrap();
        assert_eq!(
            message,
            AuthMessage::AuthRequest {
                identity: Identity(7),
                ticket: vec![1, 2],
            }
        );
    }

    #[test]
    fn test_decode_response_with_bad_status_fails() {
        let bytes = br#"{"type":"AuthResponse","status":9}"#;
        let result: Result<AuthMessage, _> = JsonCodec.decode(bytes);
        assert!(result.is_err());
    }

    // =====================================================================
    // Frame
    // =====================================================================

    #[test]
    fn test_frame_app_is_tag_plus_raw_bytes() {
        let payload = vec![0xFF; 1200];
        let bytes = Frame::App(payload.clone()).encode(&JsonCodec).unwrap();

        assert_eq!(bytes.len(), 1201);
        assert_eq!(bytes[0], Frame::APP_TAG);
        assert_eq!(&bytes[1..], payload.as_slice());
    }

    #[test]
    fn test_frame_app_body_is_borrowed() {
        let frame = Frame::App(b"abc".to_vec());
        let body = frame.encode_body(&JsonCodec).unwrap();
        assert!(matches!(body, std::borrow::Cow::Borrowed(_)));
        assert_eq!(&*body, b"abc");
    }

    #[test]
    fn test_frame_auth_body_is_codec_encoded() {
        let bytes = Frame::auth_response(AuthStatus::Ok)
            .encode(&JsonCodec)
            .unwrap();
        assert_eq!(bytes[0], Frame::AUTH_TAG);
        assert_eq!(&bytes[1..], br#"{"type":"AuthResponse","status":0}"#);
    }

    #[test]
    fn test_frame_decode_reads_both_kinds() {
        let mut auth = vec![Frame::AUTH_TAG];
        auth.extend_from_slice(br#"{"type":"AuthRequest","identity":42,"ticket":[97,98,99]}"#);
        assert_eq!(
            Frame::decode(&JsonCodec, &auth).unwrap(),
            Frame::auth_request(Identity(42), b"abc".to_vec())
        );
        assert_eq!(
            Frame::decode(&JsonCodec, &[Frame::APP_TAG, 1, 2]).unwrap(),
            Frame::App(vec![1, 2])
        );
        assert_eq!(
            Frame::decode(&JsonCodec, &[Frame::APP_TAG]).unwrap(),
            Frame::App(Vec::new())
        );
    }

    #[test]
    fn test_frame_decode_empty_or_unknown_tag_is_invalid() {
        assert!(matches!(
            Frame::decode(&JsonCodec, &[]),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert!(matches!(
            Frame::decode(&JsonCodec, &[9, 1]),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_frame_decode_bad_auth_body_is_decode_error() {
        assert!(matches!(
            Frame::decode(&JsonCodec, &[Frame::AUTH_TAG, b'{']),
            Err(ProtocolError::Decode(_))
        ));
    }
}
