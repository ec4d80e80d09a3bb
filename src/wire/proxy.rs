//! Acknowledged envelope: data messages carrying a channel publication and
//! zero-payload acknowledgments that echo a data message's id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{SIZE_FIELD, get_fixed_str, put_fixed_str, put_payload};
use crate::config::Limits;
use crate::error::CodecError;

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Data = 0,
    Ack = 1,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Data),
            1 => Some(MessageKind::Ack),
            _ => None,
        }
    }
}

/// Size of an encoded acknowledged envelope under `limits`.
pub fn frame_size(limits: &Limits) -> usize {
    1 + SIZE_FIELD + SIZE_FIELD + limits.max_payload_size + SIZE_FIELD + limits.max_channel_name
}

/// An acknowledged-mode envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    pub kind: MessageKind,
    /// Best-effort unique tag, echoed back in the acknowledgment.
    pub id: u32,
    pub payload: Bytes,
    pub channel: String,
}

impl ProxyMessage {
    /// Build a data message, rejecting payloads and channel names that do
    /// not fit the wire fields.
    pub fn data(
        id: u32,
        payload: impl Into<Bytes>,
        channel: &str,
        limits: &Limits,
    ) -> Result<Self, CodecError> {
        let payload = payload.into();
        if payload.len() > limits.max_payload_size {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max: limits.max_payload_size,
            });
        }
        if channel.len() >= limits.max_channel_name {
            return Err(CodecError::ChannelNameTooLong {
                len: channel.len(),
                max: limits.channel_name_max(),
            });
        }
        Ok(Self {
            kind: MessageKind::Data,
            id,
            payload,
            channel: channel.to_string(),
        })
    }

    /// Acknowledgment of data message `id`.
    pub fn ack(id: u32) -> Self {
        Self {
            kind: MessageKind::Ack,
            id,
            payload: Bytes::new(),
            channel: String::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Ack
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut, limits: &Limits) -> Result<(), CodecError> {
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.payload.len() as u32);
        put_payload(buf, &self.payload, limits.max_payload_size)?;

        // Length is patched after the name is written so it matches any
        // truncation applied to the name.
        let len_at = buf.len();
        buf.put_u32_le(0);
        let written = put_fixed_str(buf, &self.channel, limits.max_channel_name, "channel");
        buf[len_at..len_at + SIZE_FIELD].copy_from_slice(&(written as u32).to_le_bytes());
        Ok(())
    }

    /// Decode from a buffer already checked to be exactly one frame long.
    pub(crate) fn decode_from(bytes: &[u8], limits: &Limits) -> Result<Self, CodecError> {
        let mut cur = bytes;
        let raw_kind = cur.get_u8();
        let kind = MessageKind::from_u8(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;
        let id = cur.get_u32_le();
        let payload_size = cur.get_u32_le() as usize;
        check_payload_size(kind, payload_size, limits)?;

        let payload = Bytes::copy_from_slice(&cur[..payload_size]);
        cur.advance(limits.max_payload_size);
        let name_len = cur.get_u32_le() as usize;
        let channel = get_fixed_str(&cur[..limits.max_channel_name], name_len, "channel");

        Ok(Self {
            kind,
            id,
            payload,
            channel,
        })
    }
}

fn check_payload_size(kind: MessageKind, size: usize, limits: &Limits) -> Result<(), CodecError> {
    let max = match kind {
        MessageKind::Data => limits.max_payload_size,
        MessageKind::Ack => 0,
    };
    if size > max {
        return Err(CodecError::InvalidPayloadSize { size, max });
    }
    Ok(())
}

/// Strict header check for a frame cut out of a byte stream.
pub(crate) fn validate_header(bytes: &[u8], limits: &Limits) -> Result<(), CodecError> {
    let mut cur = bytes;
    let raw_kind = cur.get_u8();
    let kind = MessageKind::from_u8(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;
    let _id = cur.get_u32_le();
    check_payload_size(kind, cur.get_u32_le() as usize, limits)?;
    cur.advance(limits.max_payload_size);

    let name_len = cur.get_u32_le() as usize;
    let max = limits.channel_name_max();
    let in_bounds = match kind {
        MessageKind::Data => (1..=max).contains(&name_len),
        MessageKind::Ack => name_len <= max,
    };
    if !in_bounds {
        return Err(CodecError::InvalidNameLength {
            field: "channel",
            len: name_len,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::wire::{Codec, Frame, WireFormat};

    fn limits() -> Limits {
        Limits {
            max_payload_size: 8,
            max_channel_name: 6,
            max_domain_name: 8,
        }
    }

    fn codec() -> Codec {
        Codec::new(WireFormat::Acknowledged, limits())
    }

    #[test]
    fn test_layout_is_little_endian_and_packed() {
        let msg = ProxyMessage::data(0x0403_0201, vec![0xAA, 0xBB], "temp", &limits()).unwrap();
        let bytes = codec().encode(&Frame::Proxy(msg)).unwrap();

        assert_eq!(bytes.len(), 13 + 8 + 6);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..9], &[2, 0, 0, 0]);
        assert_eq!(&bytes[9..11], &[0xAA, 0xBB]);
        assert!(bytes[11..17].iter().all(|b| *b == 0));
        assert_eq!(&bytes[17..21], &[4, 0, 0, 0]);
        assert_eq!(&bytes[21..27], b"temp\0\0");
    }

    #[test]
    fn test_ack_round_trip() {
        let bytes = codec().encode(&Frame::Proxy(ProxyMessage::ack(42))).unwrap();
        assert_eq!(bytes[0], MessageKind::Ack as u8);
        match codec().decode(&bytes).unwrap() {
            Frame::Proxy(msg) => {
                assert!(msg.is_ack());
                assert_eq!(msg.id, 42);
                assert!(msg.payload.is_empty());
            }
            other => panic!("Expected proxy frame, got {:?}", other),
        }
        codec().validate(&bytes).unwrap();
    }

    #[test]
    fn test_data_rejects_oversized_inputs() {
        assert_eq!(
            ProxyMessage::data(1, vec![0u8; 9], "t", &limits()).unwrap_err(),
            CodecError::PayloadTooLarge { size: 9, max: 8 }
        );
        assert_eq!(
            ProxyMessage::data(1, vec![0u8; 1], "sixsix", &limits()).unwrap_err(),
            CodecError::ChannelNameTooLong { len: 6, max: 5 }
        );
    }

    #[test]
    fn test_decode_rejects_bad_header_fields() {
        let msg = ProxyMessage::data(5, vec![1u8], "t", &limits()).unwrap();
        let good = codec().encode(&Frame::Proxy(msg)).unwrap();

        let mut unknown = good.to_vec();
        unknown[0] = 7;
        assert_eq!(codec().decode(&unknown).unwrap_err(), CodecError::UnknownKind(7));

        let mut too_big = good.to_vec();
        too_big[5..9].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            codec().decode(&too_big).unwrap_err(),
            CodecError::InvalidPayloadSize { size: 9, max: 8 }
        );

        let mut ack_with_payload = good.to_vec();
        ack_with_payload[0] = MessageKind::Ack as u8;
        assert_eq!(
            codec().decode(&ack_with_payload).unwrap_err(),
            CodecError::InvalidPayloadSize { size: 1, max: 0 }
        );
    }

    #[test]
    fn test_decode_truncates_long_name_but_validate_rejects_it() {
        let msg = ProxyMessage::data(5, vec![1u8], "abcde", &limits()).unwrap();
        let mut bytes = codec().encode(&Frame::Proxy(msg)).unwrap().to_vec();
        bytes[17..21].copy_from_slice(&40u32.to_le_bytes());

        match codec().decode(&bytes).unwrap() {
            Frame::Proxy(decoded) => assert_eq!(decoded.channel, "abcde"),
            other => panic!("Expected proxy frame, got {:?}", other),
        }
        assert_eq!(
            codec().validate(&bytes).unwrap_err(),
            CodecError::InvalidNameLength {
                field: "channel",
                len: 40,
                max: 5
            }
        );
    }

    #[test]
    fn test_validate_rejects_unnamed_data() {
        let mut bytes = vec![0u8; frame_size(&limits())];
        bytes[5..9].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            codec().validate(&bytes),
            Err(CodecError::InvalidNameLength { len: 0, .. })
        ));
    }
}
