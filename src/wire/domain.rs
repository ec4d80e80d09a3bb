//! Domain-tagged envelope used by one-way forwarders.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{SIZE_FIELD, fitting_prefix, get_fixed_str, put_fixed_str, put_payload};
use crate::config::Limits;
use crate::error::CodecError;

/// Size of an encoded domain envelope under `limits`.
pub fn frame_size(limits: &Limits) -> usize {
    limits.max_domain_name
        + SIZE_FIELD
        + SIZE_FIELD
        + limits.max_payload_size
        + SIZE_FIELD
        + limits.max_channel_name
}

/// A publication tagged with the domain it originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMessage {
    pub domain: String,
    pub payload: Bytes,
    pub channel: String,
}

impl DomainMessage {
    /// Wrap a publication. An over-long domain is truncated with a warning;
    /// an oversized payload or channel name is an error.
    pub fn wrap(
        domain: &str,
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
        let fitted = fitting_prefix(domain, limits.domain_name_max());
        if fitted.len() < domain.len() {
            tracing::warn!(
                domain,
                truncated = fitted,
                max = limits.domain_name_max(),
                "Domain name too long, truncated"
            );
        }
        Ok(Self {
            domain: fitted.to_string(),
            payload,
            channel: channel.to_string(),
        })
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut, limits: &Limits) -> Result<(), CodecError> {
        let domain_len = put_fixed_str(buf, &self.domain, limits.max_domain_name, "domain");
        buf.put_u32_le(domain_len as u32);
        buf.put_u32_le(self.payload.len() as u32);
        put_payload(buf, &self.payload, limits.max_payload_size)?;

        let len_at = buf.len();
        buf.put_u32_le(0);
        let written = put_fixed_str(buf, &self.channel, limits.max_channel_name, "channel");
        buf[len_at..len_at + SIZE_FIELD].copy_from_slice(&(written as u32).to_le_bytes());
        Ok(())
    }

    pub(crate) fn decode_from(bytes: &[u8], limits: &Limits) -> Result<Self, CodecError> {
        let (domain_field, mut cur) = bytes.split_at(limits.max_domain_name);
        let domain_len = cur.get_u32_le() as usize;
        let domain = get_fixed_str(domain_field, domain_len, "domain");

        let payload_size = cur.get_u32_le() as usize;
        if payload_size > limits.max_payload_size {
            return Err(CodecError::InvalidPayloadSize {
                size: payload_size,
                max: limits.max_payload_size,
            });
        }
        let payload = Bytes::copy_from_slice(&cur[..payload_size]);
        cur.advance(limits.max_payload_size);

        let name_len = cur.get_u32_le() as usize;
        let channel = get_fixed_str(&cur[..limits.max_channel_name], name_len, "channel");

        Ok(Self {
            domain,
            payload,
            channel,
        })
    }
}

/// Strict header check for a frame cut out of a byte stream.
pub(crate) fn validate_header(bytes: &[u8], limits: &Limits) -> Result<(), CodecError> {
    let mut cur = &bytes[limits.max_domain_name..];
    check_name_len("domain", cur.get_u32_le() as usize, limits.max_domain_name)?;

    let payload_size = cur.get_u32_le() as usize;
    if payload_size == 0 || payload_size > limits.max_payload_size {
        return Err(CodecError::InvalidPayloadSize {
            size: payload_size,
            max: limits.max_payload_size,
        });
    }
    cur.advance(limits.max_payload_size);
    check_name_len("channel", cur.get_u32_le() as usize, limits.max_channel_name)
}

fn check_name_len(field: &'static str, len: usize, capacity: usize) -> Result<(), CodecError> {
    let max = capacity.saturating_sub(1);
    if len == 0 || len > max {
        return Err(CodecError::InvalidNameLength { field, len, max });
    }
    Ok(())
}
