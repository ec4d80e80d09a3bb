//! Wire format for forwarded messages.
//!
//! Two fixed-layout envelopes exist, both densely packed little-endian with
//! `u32` size fields and NUL-padded fixed buffers:
//!
//! ```text
//! Acknowledged: [kind:1][id:4][payload_size:4][payload:P][name_len:4][name:N]
//! Domain:       [domain:D][domain_size:4][payload_size:4][payload:P][name_len:4][name:N]
//! ```
//!
//! `P`, `N` and `D` come from [`Limits`], so both ends of a link must share
//! them. A frame is always exactly [`Codec::frame_size`] bytes, which is
//! what lets the streaming transport cut a byte stream into frames without
//! any delimiter.

pub mod domain;
pub mod proxy;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::error::CodecError;

pub use domain::DomainMessage;
pub use proxy::{MessageKind, ProxyMessage};

/// Size in bytes of every length field on the wire.
pub const SIZE_FIELD: usize = 4;

/// Which envelope a backend carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Typed envelope with id, used with acknowledgments and retries.
    Acknowledged,
    /// Envelope tagged with the origin domain, fire-and-forget.
    DomainTagged,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::Acknowledged => write!(f, "acknowledged"),
            WireFormat::DomainTagged => write!(f, "domain-tagged"),
        }
    }
}

/// One decoded envelope of either format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Proxy(ProxyMessage),
    Domain(DomainMessage),
}

impl Frame {
    pub fn format(&self) -> WireFormat {
        match self {
            Frame::Proxy(_) => WireFormat::Acknowledged,
            Frame::Domain(_) => WireFormat::DomainTagged,
        }
    }

    /// Data frames must carry a payload; acknowledgments carry none.
    pub fn ensure_sendable(&self) -> Result<(), CodecError> {
        match self {
            Frame::Proxy(msg) if msg.kind == MessageKind::Data && msg.payload.is_empty() => {
                Err(CodecError::EmptyPayload)
            }
            Frame::Domain(msg) if msg.payload.is_empty() => Err(CodecError::EmptyPayload),
            _ => Ok(()),
        }
    }
}

/// Packs and unpacks frames of one format under one set of limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    format: WireFormat,
    limits: Limits,
}

impl Codec {
    pub fn new(format: WireFormat, limits: Limits) -> Self {
        Self { format, limits }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Exact size of every frame of this codec's format.
    pub fn frame_size(&self) -> usize {
        match self.format {
            WireFormat::Acknowledged => proxy::frame_size(&self.limits),
            WireFormat::DomainTagged => domain::frame_size(&self.limits),
        }
    }

    pub fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.frame_size());
        match (self.format, frame) {
            (WireFormat::Acknowledged, Frame::Proxy(msg)) => msg.encode_into(&mut buf, &self.limits)?,
            (WireFormat::DomainTagged, Frame::Domain(msg)) => {
                msg.encode_into(&mut buf, &self.limits)?
            }
            _ => {
                return Err(CodecError::FormatMismatch {
                    expected: self.format,
                });
            }
        }
        debug_assert_eq!(buf.len(), self.frame_size());
        Ok(buf.freeze())
    }

    /// Decode a frame. Size fields must be in bounds; over-long names are
    /// truncated with a warning.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        self.check_size(bytes)?;
        match self.format {
            WireFormat::Acknowledged => {
                ProxyMessage::decode_from(bytes, &self.limits).map(Frame::Proxy)
            }
            WireFormat::DomainTagged => {
                DomainMessage::decode_from(bytes, &self.limits).map(Frame::Domain)
            }
        }
    }

    /// Strict header check used to detect a byte stream that has lost frame
    /// alignment. Unlike [`Codec::decode`] it also rejects empty and
    /// over-long names.
    pub fn validate(&self, bytes: &[u8]) -> Result<(), CodecError> {
        self.check_size(bytes)?;
        match self.format {
            WireFormat::Acknowledged => proxy::validate_header(bytes, &self.limits),
            WireFormat::DomainTagged => domain::validate_header(bytes, &self.limits),
        }
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let expected = self.frame_size();
        if bytes.len() != expected {
            return Err(CodecError::FrameSize {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(())
    }
}

/// Largest prefix of `value` that fits `max` bytes without splitting a char.
pub(crate) fn fitting_prefix(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Write `value` into a `capacity`-byte NUL-padded field, truncating to
/// `capacity - 1` bytes. Returns the number of name bytes written.
pub(crate) fn put_fixed_str(
    buf: &mut BytesMut,
    value: &str,
    capacity: usize,
    field: &'static str,
) -> usize {
    let fitted = fitting_prefix(value, capacity.saturating_sub(1));
    if fitted.len() < value.len() {
        tracing::warn!(
            field,
            len = value.len(),
            capacity,
            truncated = fitted,
            "Name too long, truncated"
        );
    }
    buf.put_slice(fitted.as_bytes());
    buf.put_bytes(0, capacity - fitted.len());
    fitted.len()
}

/// Write a payload into a `capacity`-byte zero-padded field.
pub(crate) fn put_payload(
    buf: &mut BytesMut,
    payload: &[u8],
    capacity: usize,
) -> Result<(), CodecError> {
    if payload.len() > capacity {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            max: capacity,
        });
    }
    buf.put_slice(payload);
    buf.put_bytes(0, capacity - payload.len());
    Ok(())
}

/// Read a name out of its fixed field. The declared length is clamped to
/// the field (with a warning) and the name stops at the first NUL.
pub(crate) fn get_fixed_str(field_bytes: &[u8], declared: usize, field: &'static str) -> String {
    let max = field_bytes.len().saturating_sub(1);
    let mut len = declared;
    if len > max {
        tracing::warn!(field, declared, max, "Received name length out of bounds, truncated");
        len = max;
    }
    let raw = &field_bytes[..len];
    let raw = match raw.iter().position(|b| *b == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn limits() -> Limits {
        Limits {
            max_payload_size: 16,
            max_channel_name: 8,
            max_domain_name: 8,
        }
    }

    #[test]
    fn test_frame_sizes() {
        let acked = Codec::new(WireFormat::Acknowledged, limits());
        let tagged = Codec::new(WireFormat::DomainTagged, limits());
        assert_eq!(acked.frame_size(), 1 + 4 + 4 + 16 + 4 + 8);
        assert_eq!(tagged.frame_size(), 8 + 4 + 4 + 16 + 4 + 8);
    }

    #[test]
    fn test_payload_round_trip_keeps_zero_bytes() {
        let codec = Codec::new(WireFormat::Acknowledged, limits());
        for size in [0usize, 1, 7, 16] {
            let payload: Vec<u8> = (0..size).map(|i| if i % 2 == 0 { 0 } else { i as u8 }).collect();
            let msg = ProxyMessage::data(9, payload.clone(), "temp", &limits()).unwrap();
            let bytes = codec.encode(&Frame::Proxy(msg.clone())).unwrap();
            assert_eq!(bytes.len(), codec.frame_size());
            match codec.decode(&bytes).unwrap() {
                Frame::Proxy(decoded) => {
                    assert_eq!(decoded, msg);
                    assert_eq!(decoded.payload.as_ref(), payload.as_slice());
                }
                other => panic!("Expected proxy frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_channel_names_below_capacity_round_trip() {
        let codec = Codec::new(WireFormat::Acknowledged, limits());
        for name in ["a", "temp", "seven77"] {
            let msg = ProxyMessage::data(1, vec![1u8], name, &limits()).unwrap();
            let bytes = codec.encode(&Frame::Proxy(msg)).unwrap();
            let name_field = &bytes[bytes.len() - 8..];
            assert_eq!(&name_field[..name.len()], name.as_bytes());
            assert_eq!(name_field[name.len()], 0, "name must be NUL-terminated");
            match codec.decode(&bytes).unwrap() {
                Frame::Proxy(decoded) => assert_eq!(decoded.channel, name),
                other => panic!("Expected proxy frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let codec = Codec::new(WireFormat::Acknowledged, limits());
        let err = codec.decode(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            CodecError::FrameSize {
                expected: codec.frame_size(),
                actual: 10
            }
        );
    }

    #[test]
    fn test_encode_rejects_format_mismatch() {
        let codec = Codec::new(WireFormat::DomainTagged, limits());
        let err = codec.encode(&Frame::Proxy(ProxyMessage::ack(3))).unwrap_err();
        assert_eq!(
            err,
            CodecError::FormatMismatch {
                expected: WireFormat::DomainTagged
            }
        );
    }

    #[test]
    fn test_fitting_prefix_respects_char_boundaries() {
        assert_eq!(fitting_prefix("abc", 5), "abc");
        assert_eq!(fitting_prefix("abcdef", 3), "abc");
        // 'é' is two bytes; cutting at 2 would split it.
        assert_eq!(fitting_prefix("aé", 2), "a");
    }

    #[test]
    fn test_get_fixed_str_clamps_declared_length() {
        let field = b"abcdefg\0";
        assert_eq!(get_fixed_str(field, 3, "channel"), "abc");
        assert_eq!(get_fixed_str(field, 200, "channel"), "abcdefg");
        assert_eq!(get_fixed_str(b"ab\0\0\0", 4, "channel"), "ab");
    }

    #[test]
    fn test_empty_data_is_not_sendable() {
        let msg = ProxyMessage::data(1, Vec::<u8>::new(), "temp", &limits()).unwrap();
        assert_eq!(
            Frame::Proxy(msg).ensure_sendable(),
            Err(CodecError::EmptyPayload)
        );
        assert!(Frame::Proxy(ProxyMessage::ack(1)).ensure_sendable().is_ok());
    }
}
