use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod events;
pub mod handshake;
pub mod signal;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
pub const MAX_CONTROL_JSON_LEN: usize = 128 * 1024;
/// Sequences stay below 2^53 so they survive JSON number handling intact.
pub const MAX_SEQUENCE: u64 = (1 << 53) - 1;

/// Logical traffic category. Every connection is bound to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Messaging,
    Presence,
    Signaling,
}

impl ChannelKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Messaging),
            0x02 => Some(Self::Presence),
            0x03 => Some(Self::Signaling),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Messaging => 0x01,
            Self::Presence => 0x02,
            Self::Signaling => 0x03,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messaging => "messaging",
            Self::Presence => "presence",
            Self::Signaling => "signaling",
        }
    }

    /// Liveness pings run only where silence is meaningful.
    pub fn requires_heartbeat(self) -> bool {
        matches!(self, Self::Presence)
    }
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Event = 0x05,
    Signal = 0x06,
    BackfillRequest = 0x07,
    BackfillResponse = 0x08,
    Error = 0x09,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Welcome),
            0x03 => Some(Self::Ping),
            0x04 => Some(Self::Pong),
            0x05 => Some(Self::Event),
            0x06 => Some(Self::Signal),
            0x07 => Some(Self::BackfillRequest),
            0x08 => Some(Self::BackfillResponse),
            0x09 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidFrameType,
    InvalidChannel,
    InvalidControlJson,
    UnexpectedEof,
    VarintOverflow,
    PayloadTooLarge,
    FrameTooLarge,
    ControlTooLarge,
    SequenceTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFrameType => write!(f, "invalid frame type"),
            Self::InvalidChannel => write!(f, "invalid channel tag"),
            Self::InvalidControlJson => write!(f, "invalid control payload"),
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::VarintOverflow => write!(f, "varint overflow"),
            Self::PayloadTooLarge => write!(f, "payload exceeds limits"),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::ControlTooLarge => write!(f, "control payload exceeds limits"),
            Self::SequenceTooLarge => write!(f, "sequence exceeds limits"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlEnvelope {
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Control(ControlEnvelope),
    Opaque(Vec<u8>),
}

impl FramePayload {
    fn bytes(&self) -> Result<Cow<'_, [u8]>, CodecError> {
        match self {
            FramePayload::Control(ctrl) => {
                let encoded =
                    serde_json::to_vec(ctrl).map_err(|_| CodecError::InvalidControlJson)?;
                if encoded.len() > MAX_CONTROL_JSON_LEN {
                    return Err(CodecError::ControlTooLarge);
                }
                Ok(Cow::Owned(encoded))
            }
            FramePayload::Opaque(data) => Ok(Cow::Borrowed(data)),
        }
    }

    fn from_bytes(frame_type: FrameType, data: &[u8]) -> Result<Self, CodecError> {
        match frame_type {
            FrameType::Ping | FrameType::Pong => Ok(FramePayload::Opaque(data.to_vec())),
            FrameType::Hello
            | FrameType::Welcome
            | FrameType::Event
            | FrameType::Signal
            | FrameType::BackfillRequest
            | FrameType::BackfillResponse
            | FrameType::Error => {
                if data.len() > MAX_CONTROL_JSON_LEN {
                    return Err(CodecError::ControlTooLarge);
                }
                serde_json::from_slice::<ControlEnvelope>(data)
                    .map(FramePayload::Control)
                    .map_err(|_| CodecError::InvalidControlJson)
            }
        }
    }
}

/// One unit of channel traffic. `sequence` carries the per-scope event
/// sequence on Event frames and is zero elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: ChannelKind,
    pub sequence: u64,
    pub frame_type: FrameType,
    pub payload: FramePayload,
}

impl Frame {
    pub fn control<T>(
        channel: ChannelKind,
        frame_type: FrameType,
        value: T,
    ) -> Result<Self, CodecError>
    where
        T: TryInto<ControlEnvelope, Error = CodecError>,
    {
        Ok(Frame {
            channel,
            sequence: 0,
            frame_type,
            payload: FramePayload::Control(value.try_into()?),
        })
    }

    /// Serializes a frame into a length prefixed binary representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let payload = self.payload.bytes()?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        let mut body = Vec::new();
        body.push(self.frame_type as u8);
        body.push(self.channel.as_u8());
        encode_varint(self.sequence, &mut body);
        encode_varint(payload.len() as u64, &mut body);
        body.extend_from_slice(payload.as_ref());
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let mut encoded = Vec::new();
        encode_varint(body.len() as u64, &mut encoded);
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    /// Attempts to decode a frame from a contiguous buffer. Returns the frame
    /// and the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let (frame_len_raw, header_len) = decode_varint(buffer)?;
        let frame_len = usize::try_from(frame_len_raw).map_err(|_| CodecError::FrameTooLarge)?;
        if frame_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        if buffer.len() < header_len + frame_len {
            return Err(CodecError::UnexpectedEof);
        }
        let frame_slice = &buffer[header_len..header_len + frame_len];
        if frame_slice.len() < 2 {
            return Err(CodecError::UnexpectedEof);
        }
        let frame_type = FrameType::from_u8(frame_slice[0]).ok_or(CodecError::InvalidFrameType)?;
        let channel = ChannelKind::from_u8(frame_slice[1]).ok_or(CodecError::InvalidChannel)?;
        let mut cursor = 2;
        let (sequence, read) = decode_varint(&frame_slice[cursor..])?;
        cursor += read;
        if sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let (payload_len_raw, read) = decode_varint(&frame_slice[cursor..])?;
        cursor += read;
        let payload_len =
            usize::try_from(payload_len_raw).map_err(|_| CodecError::PayloadTooLarge)?;
        if payload_len > MAX_FRAME_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        if frame_slice.len() < cursor + payload_len {
            return Err(CodecError::UnexpectedEof);
        }
        let payload_slice = &frame_slice[cursor..cursor + payload_len];
        let payload = FramePayload::from_bytes(frame_type, payload_slice)?;
        let total = header_len + frame_len;
        Ok((
            Frame {
                channel,
                sequence,
                frame_type,
                payload,
            },
            total,
        ))
    }
}

fn encode_varint(mut value: u64, buffer: &mut Vec<u8>) {
    while value >= 0x80 {
        buffer.push(((value as u8) & 0x7f) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

fn decode_varint(buffer: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in buffer.iter().enumerate() {
        let part = (byte & 0x7f) as u64;
        value |= part << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

pub(crate) fn encode_control<T: Serialize>(value: T) -> Result<ControlEnvelope, CodecError> {
    serde_json::to_value(value)
        .map(|properties| ControlEnvelope { properties })
        .map_err(|_| CodecError::InvalidControlJson)
}

pub(crate) fn decode_control<T: DeserializeOwned>(
    envelope: &ControlEnvelope,
) -> Result<T, CodecError> {
    serde_json::from_value(envelope.properties.clone()).map_err(|_| CodecError::InvalidControlJson)
}

macro_rules! impl_control_codec {
    ($ty:ty) => {
        impl TryFrom<$ty> for $crate::ControlEnvelope {
            type Error = $crate::CodecError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                $crate::encode_control(value)
            }
        }

        impl TryFrom<&$ty> for $crate::ControlEnvelope {
            type Error = $crate::CodecError;

            fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                $crate::encode_control(value)
            }
        }

        impl TryFrom<&$crate::ControlEnvelope> for $ty {
            type Error = $crate::CodecError;

            fn try_from(envelope: &$crate::ControlEnvelope) -> Result<Self, Self::Error> {
                $crate::decode_control::<$ty>(envelope)
            }
        }
    };
}

pub(crate) use impl_control_codec;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip_control_frame() {
        let frame = Frame {
            channel: ChannelKind::Messaging,
            sequence: 34,
            frame_type: FrameType::Hello,
            payload: FramePayload::Control(ControlEnvelope {
                properties: serde_json::json!({
                    "protocol_version": PROTOCOL_VERSION,
                    "channel": "messaging",
                }),
            }),
        };
        let encoded = frame.encode().unwrap();
        let (decoded, read) = Frame::decode(&encoded).unwrap();
        assert_eq!(read, encoded.len());
        assert_eq!(decoded.channel, ChannelKind::Messaging);
        assert_eq!(decoded.sequence, 34);
        assert_eq!(decoded.frame_type, FrameType::Hello);
        match decoded.payload {
            FramePayload::Control(ctrl) => {
                let version = ctrl.properties.get("protocol_version").unwrap();
                assert_eq!(version.as_u64(), Some(PROTOCOL_VERSION as u64));
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn encode_roundtrip_ping_frame() {
        let frame = Frame {
            channel: ChannelKind::Presence,
            sequence: 0,
            frame_type: FrameType::Ping,
            payload: FramePayload::Opaque(7u64.to_be_bytes().to_vec()),
        };
        let encoded = frame.encode().unwrap();
        let (decoded, _read) = Frame::decode(&encoded).unwrap();
        assert_eq!(
            decoded.payload,
            FramePayload::Opaque(7u64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn decode_multiple_frames_in_sequence() {
        let frame1 = Frame {
            channel: ChannelKind::Messaging,
            sequence: 11,
            frame_type: FrameType::Event,
            payload: FramePayload::Control(ControlEnvelope {
                properties: serde_json::json!({"kind": "message_received"}),
            }),
        };
        let frame2 = Frame {
            channel: ChannelKind::Messaging,
            sequence: 0,
            frame_type: FrameType::Ping,
            payload: FramePayload::Opaque(vec![9, 8, 7]),
        };
        let mut concatenated = frame1.encode().unwrap();
        let second = frame2.encode().unwrap();
        let first_len = concatenated.len();
        concatenated.extend_from_slice(&second);
        let (decoded1, read1) = Frame::decode(&concatenated).unwrap();
        assert_eq!(read1, first_len);
        assert_eq!(decoded1.sequence, 11);
        let (decoded2, read2) = Frame::decode(&concatenated[read1..]).unwrap();
        assert_eq!(read1 + read2, concatenated.len());
        assert_eq!(decoded2.payload, FramePayload::Opaque(vec![9, 8, 7]));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let frame = Frame {
            channel: ChannelKind::Signaling,
            sequence: 2,
            frame_type: FrameType::Pong,
            payload: FramePayload::Opaque(vec![0xaa, 0xbb, 0xcc]),
        };
        let encoded = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&encoded[..encoded.len() - 1]),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn decode_rejects_varint_overflow() {
        let buffer = vec![0xff; 10];
        assert!(matches!(
            Frame::decode(&buffer),
            Err(CodecError::VarintOverflow)
        ));
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        let frame = Frame {
            channel: ChannelKind::Messaging,
            sequence: 4,
            frame_type: FrameType::Error,
            payload: FramePayload::Control(ControlEnvelope {
                properties: serde_json::json!({"code": "oops"}),
            }),
        };
        let mut encoded = frame.encode().unwrap();
        let (_, header_len) = decode_varint(&encoded).unwrap();
        encoded[header_len] = 0xff;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(CodecError::InvalidFrameType)
        ));
    }

    #[test]
    fn decode_rejects_unknown_channel() {
        let frame = Frame {
            channel: ChannelKind::Messaging,
            sequence: 4,
            frame_type: FrameType::Ping,
            payload: FramePayload::Opaque(vec![1]),
        };
        let mut encoded = frame.encode().unwrap();
        let (_, header_len) = decode_varint(&encoded).unwrap();
        encoded[header_len + 1] = 0x7e;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(CodecError::InvalidChannel)
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut buffer = Vec::new();
        encode_varint((MAX_FRAME_LEN + 1) as u64, &mut buffer);
        assert!(matches!(
            Frame::decode(&buffer),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[test]
    fn encode_rejects_oversized_sequence() {
        let frame = Frame {
            channel: ChannelKind::Messaging,
            sequence: MAX_SEQUENCE + 1,
            frame_type: FrameType::Ping,
            payload: FramePayload::Opaque(Vec::new()),
        };
        assert!(matches!(frame.encode(), Err(CodecError::SequenceTooLarge)));
    }

    #[test]
    fn heartbeat_policy_is_presence_only() {
        assert!(ChannelKind::Presence.requires_heartbeat());
        assert!(!ChannelKind::Messaging.requires_heartbeat());
        assert!(!ChannelKind::Signaling.requires_heartbeat());
    }
}
