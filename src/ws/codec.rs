//! Binary wire codec.
//!
//! Every frame starts with a one-byte message-type discriminant followed by
//! a payload. Strings are u32 little-endian length-prefixed UTF-8; integers
//! are little-endian fixed width. A `Match` frame carries an i64 timestamp
//! plus the serialized match message; the inner payload is decoded
//! separately (see [`crate::game::messages::MatchMessage`]) so a bad inner
//! message never costs the connection. Pure encode/decode, no I/O.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Wire message-type discriminants. The numeric values are the protocol
/// contract; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 0,
    Validate = 1,
    Connect = 2,
    Disconnect = 3,
    PlayerMovement = 4,
    Match = 5,
}

impl MessageType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageType::Discover),
            1 => Some(MessageType::Validate),
            2 => Some(MessageType::Connect),
            3 => Some(MessageType::Disconnect),
            4 => Some(MessageType::PlayerMovement),
            5 => Some(MessageType::Match),
            _ => None,
        }
    }
}

/// Unusable frame. Recoverable: the frame is dropped, the connection stays
/// up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message discriminant {0:#04x}")]
    UnknownDiscriminant(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("invalid utf-8 in string field")]
    InvalidString,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Discover,
    /// Handshake verdict; `ok == false` carries a rejection reason.
    Validate { ok: bool, reason: String },
    /// Request: JSON `ClientInfo`. Reply: JSON `MatchState` snapshot.
    Connect { payload: String },
    Disconnect { reason: String },
    /// Opaque movement update, relayed verbatim to other clients.
    PlayerMovement { data: Vec<u8> },
    /// Timestamped match message; the payload string holds one serialized
    /// `MatchMessage` variant.
    Match { timestamp: i64, payload: String },
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Discover => MessageType::Discover,
            Frame::Validate { .. } => MessageType::Validate,
            Frame::Connect { .. } => MessageType::Connect,
            Frame::Disconnect { .. } => MessageType::Disconnect,
            Frame::PlayerMovement { .. } => MessageType::PlayerMovement,
            Frame::Match { .. } => MessageType::Match,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.message_type() as u8);
        match self {
            Frame::Discover => {}
            Frame::Validate { ok, reason } => {
                buf.put_u8(*ok as u8);
                put_string(&mut buf, reason);
            }
            Frame::Connect { payload } => put_string(&mut buf, payload),
            Frame::Disconnect { reason } => put_string(&mut buf, reason),
            Frame::PlayerMovement { data } => buf.put_slice(data),
            Frame::Match { timestamp, payload } => {
                buf.put_i64_le(*timestamp);
                put_string(&mut buf, payload);
            }
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let discriminant = buf.get_u8();
        let message_type = MessageType::from_byte(discriminant)
            .ok_or(ProtocolError::UnknownDiscriminant(discriminant))?;

        match message_type {
            MessageType::Discover => Ok(Frame::Discover),
            MessageType::Validate => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::Truncated);
                }
                let ok = buf.get_u8() != 0;
                let reason = get_string(&mut buf)?;
                Ok(Frame::Validate { ok, reason })
            }
            MessageType::Connect => Ok(Frame::Connect {
                payload: get_string(&mut buf)?,
            }),
            MessageType::Disconnect => Ok(Frame::Disconnect {
                reason: get_string(&mut buf)?,
            }),
            MessageType::PlayerMovement => Ok(Frame::PlayerMovement {
                data: buf.to_vec(),
            }),
            MessageType::Match => {
                if buf.remaining() < 8 {
                    return Err(ProtocolError::Truncated);
                }
                let timestamp = buf.get_i64_le();
                let payload = get_string(&mut buf)?;
                Ok(Frame::Match { timestamp, payload })
            }
        }
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidString)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frames = vec![
            Frame::Discover,
            Frame::Validate {
                ok: false,
                reason: "Invalid game version.".into(),
            },
            Frame::Connect {
                payload: r#"{"version":1.0,"isTesting":false}"#.into(),
            },
            Frame::Disconnect {
                reason: "Kicked by server".into(),
            },
            Frame::PlayerMovement {
                data: vec![1, 2, 3, 4, 5],
            },
            Frame::Match {
                timestamp: 1_700_000_000_123,
                payload: r#"{"type":"loadRace"}"#.into(),
            },
        ];
        for frame in frames {
            let encoded = frame.encode();
            assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        assert_eq!(
            Frame::decode(&[0xAB, 0, 0]),
            Err(ProtocolError::UnknownDiscriminant(0xAB))
        );
    }

    #[test]
    fn empty_frame_is_truncated() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn truncated_string_is_rejected() {
        // Disconnect claiming a 100-byte reason with only 2 bytes present
        let mut bytes = vec![MessageType::Disconnect as u8];
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"hi");
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::Truncated));
    }

    #[test]
    fn truncated_match_timestamp_is_rejected() {
        let bytes = vec![MessageType::Match as u8, 1, 2, 3];
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::Truncated));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut bytes = vec![MessageType::Disconnect as u8];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::InvalidString));
    }

    #[test]
    fn movement_payload_is_opaque() {
        let frame = Frame::PlayerMovement {
            data: vec![0xFF; 32],
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], MessageType::PlayerMovement as u8);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }
}
