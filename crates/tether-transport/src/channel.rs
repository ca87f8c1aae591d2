//! Delivery channels and their payload limits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SendError;

/// A logical delivery class.
///
/// The set is closed: channels are never created at runtime. Each one maps
/// to a fixed maximum payload size, and [`Channel::check_payload`] must pass
/// before anything is handed to a link.
///
/// The discriminants are the ids written on the wire, so they are not
/// contiguous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum Channel {
    /// May be lost or reordered. Small datagrams only.
    Unreliable = 0,

    /// Reliable and ordered, with Nagle batching disabled.
    NoNagle = 1,

    /// Unreliable, and dropped instead of queued when the link is busy.
    NoDelay = 4,

    /// Reliable and ordered. Used for the auth handshake.
    #[default]
    Reliable = 8,
}

impl Channel {
    /// Every channel, in wire-id order.
    pub const ALL: [Channel; 4] = [
        Channel::Unreliable,
        Channel::NoNagle,
        Channel::NoDelay,
        Channel::Reliable,
    ];

    /// Payload limit for the unreliable classes (one MTU-safe datagram).
    pub const UNRELIABLE_MAX_PAYLOAD: usize = 1200;

    /// Payload limit for the reliable classes (1 MiB).
    pub const RELIABLE_MAX_PAYLOAD: usize = 1024 * 1024;

    /// Length of the tag byte a tagged send puts in front of the payload.
    /// It does not count against the payload limit.
    pub const TAG_LEN: usize = 1;

    /// The id written on the wire.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Looks up a channel by wire id.
    ///
    /// # Errors
    /// [`SendError::UnsupportedChannel`] for any id outside the closed set.
    pub fn from_id(id: u8) -> Result<Self, SendError> {
        match id {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::NoNagle),
            4 => Ok(Self::NoDelay),
            8 => Ok(Self::Reliable),
            other => Err(SendError::UnsupportedChannel(other)),
        }
    }

    /// Largest payload this channel accepts.
    pub fn max_payload(self) -> usize {
        match self {
            Self::Unreliable | Self::NoDelay => Self::UNRELIABLE_MAX_PAYLOAD,
            Self::Reliable | Self::NoNagle => Self::RELIABLE_MAX_PAYLOAD,
        }
    }

    /// Largest message a link carries on this channel: a full payload
    /// plus its tag byte. Anything bigger arriving from a remote peer is
    /// dropped.
    pub fn max_message(self) -> usize {
        self.max_payload() + Self::TAG_LEN
    }

    /// Whether delivery is guaranteed (and ordered) on this channel.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable | Self::NoNagle)
    }

    /// Validates a payload length against this channel's limit.
    pub fn check_payload(self, len: usize) -> Result<(), SendError> {
        let max = self.max_payload();
        if len > max {
            return Err(SendError::PayloadTooLarge {
                channel: self,
                size: len,
                max,
            });
        }
        Ok(())
    }
}

impl TryFrom<u8> for Channel {
    type Error = SendError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::from_id(id)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unreliable => "unreliable",
            Self::NoNagle => "no-nagle",
            Self::NoDelay => "no-delay",
            Self::Reliable => "reliable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id_known_ids_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_id(channel.id()).unwrap(), channel);
        }
    }

    #[test]
    fn test_from_id_unknown_id_is_unsupported() {
        for id in [2u8, 3, 5, 7, 9, 255] {
            assert_eq!(
                Channel::from_id(id),
                Err(SendError::UnsupportedChannel(id))
            );
        }
    }

    #[test]
    fn test_max_payload_matches_reliability_class() {
        assert_eq!(Channel::Unreliable.max_payload(), 1200);
        assert_eq!(Channel::NoDelay.max_payload(), 1200);
        assert_eq!(Channel::Reliable.max_payload(), 1_048_576);
        assert_eq!(Channel::NoNagle.max_payload(), 1_048_576);
    }

    #[test]
    fn test_check_payload_at_limit_passes_above_limit_fails() {
        for channel in Channel::ALL {
            let max = channel.max_payload();
            assert!(channel.check_payload(max).is_ok());
            assert_eq!(
                channel.check_payload(max + 1),
                Err(SendError::PayloadTooLarge {
                    channel,
                    size: max + 1,
                    max,
                })
            );
        }
    }

    #[test]
    fn test_max_message_leaves_room_for_tag() {
        assert_eq!(Channel::Unreliable.max_message(), 1201);
        assert_eq!(Channel::Reliable.max_message(), 1_048_577);
    }

    #[test]
    fn test_default_channel_is_reliable() {
        assert_eq!(Channel::default(), Channel::Reliable);
        assert!(Channel::default().is_reliable());
        assert!(!Channel::Unreliable.is_reliable());
    }
}
