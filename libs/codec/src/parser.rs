//! Raw frame header parsing
//!
//! [`FrameHeader`] is the 28-byte header read without resolving the message
//! class. Readers use it to learn the payload length before they know whether
//! the type is registered, so the payload of an unknown type can be skipped
//! and the stream stays aligned.

use crate::constants::{
    HEADER_SIZE, MAGIC_OFFSET, MAX_PAYLOAD_SIZE, PAYLOAD_LEN_OFFSET, RECIPIENT_OFFSET, SENDER_OFFSET,
    TYPE_OFFSET,
};
use crate::error::{CodecError, CodecResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

/// Decoded generic frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub type_id: u32,
    pub recipient_id: u64,
    pub sender_id: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse the header at the start of `data` and verify its magic tag
    pub fn parse(data: &[u8], expected_magic: [u8; 4]) -> CodecResult<Self> {
        let header = Self::parse_unchecked(data)?;
        if header.magic != expected_magic {
            return Err(CodecError::InvalidMagic {
                expected: expected_magic,
                actual: header.magic,
            });
        }
        Ok(header)
    }

    /// Parse the header fields without any magic check
    pub fn parse_unchecked(data: &[u8]) -> CodecResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::message_too_small(
                HEADER_SIZE,
                data.len(),
                "frame header",
            ));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[MAGIC_OFFSET..MAGIC_OFFSET + 4]);

        Ok(Self {
            magic,
            type_id: BigEndian::read_u32(&data[TYPE_OFFSET..]),
            recipient_id: BigEndian::read_u64(&data[RECIPIENT_OFFSET..]),
            sender_id: BigEndian::read_u64(&data[SENDER_OFFSET..]),
            payload_len: BigEndian::read_u32(&data[PAYLOAD_LEN_OFFSET..]),
        })
    }

    /// Payload length as usize
    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }

    /// Reject payloads larger than the accepted maximum
    pub fn check_payload_size(&self) -> CodecResult<()> {
        if self.payload_len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: self.payload_len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Append the big-endian header to `out`
    pub fn write(&self, out: &mut BytesMut) {
        out.reserve(HEADER_SIZE);
        out.put_slice(&self.magic);
        out.put_u32(self.type_id);
        out.put_u64(self.recipient_id);
        out.put_u64(self.sender_id);
        out.put_u32(self.payload_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAGIC;

    fn sample() -> FrameHeader {
        FrameHeader {
            magic: DEFAULT_MAGIC,
            type_id: 0x0000_0001,
            recipient_id: 0,
            sender_id: 5,
            payload_len: 8,
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        let mut out = BytesMut::new();
        sample().write(&mut out);
        assert_eq!(out.len(), HEADER_SIZE);
        assert_eq!(&out[0..4], b"EMSG");
        assert_eq!(&out[4..8], &[0, 0, 0, 1]);
        assert_eq!(&out[16..24], &[0, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(&out[24..28], &[0, 0, 0, 8]);
        assert_eq!(FrameHeader::parse(&out, DEFAULT_MAGIC).unwrap(), sample());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut out = BytesMut::new();
        FrameHeader {
            magic: *b"XMSG",
            ..sample()
        }
        .write(&mut out);
        let err = FrameHeader::parse(&out, DEFAULT_MAGIC).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMagic { actual, .. } if &actual == b"XMSG"));
        assert!(FrameHeader::parse_unchecked(&out).is_ok());
    }

    #[test]
    fn test_short_header_rejected() {
        let err = FrameHeader::parse(&[0u8; 27], DEFAULT_MAGIC).unwrap_err();
        assert!(matches!(err, CodecError::MessageTooSmall { need: 28, got: 27, .. }));
    }

    #[test]
    fn test_payload_limit() {
        let header = FrameHeader {
            payload_len: (MAX_PAYLOAD_SIZE + 1) as u32,
            ..sample()
        };
        assert!(matches!(
            header.check_payload_size(),
            Err(CodecError::PayloadTooLarge { .. })
        ));
        assert!(sample().check_payload_size().is_ok());
    }
}
