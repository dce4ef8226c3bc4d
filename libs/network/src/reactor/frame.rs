//! Frame reads and writes on a data stream
//!
//! A frame is a 28-byte header followed by `payload_len` bytes. Reads use
//! `read_exact`, so partial reads resume until the declared length arrives
//! or the stream fails. Writes are `write_all` plus `flush` under a timeout.

use crate::{Result, TransportError};
use emsg_codec::{CodecError, FrameHeader, Message, MessageRegistry, HEADER_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame write including flush
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of reading one frame from a healthy stream
#[derive(Debug)]
pub enum InboundFrame {
    /// A decoded message of a registered type
    Message(Message),
    /// Header with the wrong magic tag; only the header was consumed
    BadMagic { magic: [u8; 4] },
    /// Unregistered type; its payload was read and discarded
    Skipped { type_id: u32, payload_len: usize },
    /// Registered type whose payload failed to decode
    Invalid { type_id: u32, error: CodecError },
}

/// Read the next frame
///
/// Errors mean the stream is unusable: EOF, a failed or short read, a
/// payload larger than the accepted maximum, or a body whose decode error
/// is not recoverable.
pub async fn read_frame<R>(reader: &mut R, registry: &MessageRegistry) -> Result<InboundFrame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::parse_unchecked(&header_buf)?;
    if header.magic != registry.magic() {
        return Ok(InboundFrame::BadMagic { magic: header.magic });
    }
    header.check_payload_size()?;

    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await?;

    let mut msg = match registry.message_for_header(&header) {
        Ok(msg) => msg,
        Err(CodecError::UnknownType { type_id }) => {
            return Ok(InboundFrame::Skipped {
                type_id,
                payload_len: payload.len(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    match registry.decode_payload(&mut msg, &payload) {
        Ok(()) => Ok(InboundFrame::Message(msg)),
        Err(error) if error.is_recoverable() => Ok(InboundFrame::Invalid {
            type_id: header.type_id,
            error,
        }),
        Err(error) => Err(error.into()),
    }
}

/// Write one encoded frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    tokio::time::timeout(WRITE_TIMEOUT, write)
        .await
        .map_err(|_| TransportError::timeout("frame write", WRITE_TIMEOUT.as_millis() as u64))?
        .map_err(|e| TransportError::io("frame write failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use emsg_codec::{types, FieldKind, FieldValue, MessageBody, MessageClass, PeerIdBody};
    use tokio_test::io::Builder;

    fn frame(registry: &MessageRegistry, msg: &Message) -> Vec<u8> {
        registry.encode(msg).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_partial_reads_resume() {
        let registry = MessageRegistry::new();
        let bytes = frame(&registry, &registry.set_id(2, 0, 2));

        let mut mock = Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..20])
            .read(&bytes[20..30])
            .read(&bytes[30..])
            .build();

        match read_frame(&mut mock, &registry).await.unwrap() {
            InboundFrame::Message(msg) => {
                assert_eq!(msg.type_id, types::SET_ID);
                assert_eq!(msg.body_as::<PeerIdBody>().unwrap().peer_id, 2);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_magic_consumes_header_only() {
        let registry = MessageRegistry::new();
        let mut bad = frame(&registry, &registry.control(types::LEAVE, 0, 1));
        bad[..4].copy_from_slice(b"JUNK");
        let good = frame(&registry, &registry.control(types::TERM, 1, 0));

        let mut mock = Builder::new().read(&bad).read(&good).build();

        assert!(matches!(
            read_frame(&mut mock, &registry).await.unwrap(),
            InboundFrame::BadMagic { magic } if &magic == b"JUNK"
        ));
        match read_frame(&mut mock, &registry).await.unwrap() {
            InboundFrame::Message(msg) => assert_eq!(msg.type_id, types::TERM),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_payload_skipped() {
        let sender = MessageRegistry::new();
        sender
            .register_type(MessageClass::record(0x55, "remote-only", &[("n", FieldKind::U64)]))
            .unwrap();
        let unknown = frame(&sender, &sender.new_message(0x55, 0, 1, [("n", FieldValue::U64(1))]).unwrap());

        let receiver = MessageRegistry::new();
        let follow = frame(&receiver, &receiver.control(types::LEAVE, 0, 1));

        let mut mock = Builder::new().read(&unknown).read(&follow).build();
        assert!(matches!(
            read_frame(&mut mock, &receiver).await.unwrap(),
            InboundFrame::Skipped { type_id: 0x55, payload_len: 8 }
        ));
        assert!(matches!(
            read_frame(&mut mock, &receiver).await.unwrap(),
            InboundFrame::Message(_)
        ));
    }

    #[tokio::test]
    async fn test_short_payload_is_invalid_not_fatal() {
        let registry = MessageRegistry::new();
        registry
            .register_type(MessageClass::record(0x56, "pair", &[("a", FieldKind::U64), ("b", FieldKind::U64)]))
            .unwrap();
        let msg = registry
            .new_message(0x56, 0, 1, [("a", FieldValue::U64(1)), ("b", FieldValue::U64(2))])
            .unwrap();
        let mut bytes = frame(&registry, &msg);
        // Declare 4 bytes and send 4 bytes: below the class minimum
        bytes[24..28].copy_from_slice(&4u32.to_be_bytes());
        bytes.truncate(HEADER_SIZE + 4);

        let mut mock = Builder::new().read(&bytes).build();
        assert!(matches!(
            read_frame(&mut mock, &registry).await.unwrap(),
            InboundFrame::Invalid { type_id: 0x56, error: CodecError::PayloadTooSmall { .. } }
        ));
    }

    /// Body carrying a nested frame header, as a relay would
    #[derive(Debug, Default)]
    struct Nested {
        header: Option<FrameHeader>,
    }

    impl MessageBody for Nested {
        fn encode_payload(&self, out: &mut BytesMut) {
            out.extend_from_slice(&[0u8; 4]);
        }

        fn decode_payload(&mut self, _type_id: u32, payload: &[u8]) -> emsg_codec::CodecResult<()> {
            self.header = Some(FrameHeader::parse_unchecked(payload)?);
            Ok(())
        }

        fn clone_body(&self) -> Box<dyn MessageBody> {
            Box::new(Nested { header: self.header })
        }
    }

    #[tokio::test]
    async fn test_unrecoverable_body_error_is_fatal() {
        let registry = MessageRegistry::new();
        registry
            .register_type(MessageClass::new(0x57, "nested", 0, || Box::new(Nested::default())))
            .unwrap();
        let msg = Message::new(0x57, 0, 1, Box::new(Nested::default()));
        let bytes = frame(&registry, &msg);

        let mut mock = Builder::new().read(&bytes).build();
        let err = read_frame(&mut mock, &registry).await.unwrap_err();
        assert_eq!(err.category(), "codec");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_oversized_payload_is_fatal() {
        let registry = MessageRegistry::new();
        let mut bytes = frame(&registry, &registry.control(types::LEAVE, 0, 1));
        bytes[24..28].copy_from_slice(&u32::MAX.to_be_bytes());

        let mut mock = Builder::new().read(&bytes).build();
        let err = read_frame(&mut mock, &registry).await.unwrap_err();
        assert_eq!(err.category(), "codec");
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_fatal() {
        let registry = MessageRegistry::new();
        let bytes = frame(&registry, &registry.set_id(1, 0, 1));

        let mut mock = Builder::new().read(&bytes[..HEADER_SIZE + 3]).build();
        let err = read_frame(&mut mock, &registry).await.unwrap_err();
        assert_eq!(err.category(), "io");
    }

    #[tokio::test]
    async fn test_write_frame_resumes_partial_writes() {
        let registry = MessageRegistry::new();
        let bytes = frame(&registry, &registry.set_id(3, 0, 3));

        let mut mock = Builder::new().write(&bytes[..10]).write(&bytes[10..]).build();
        write_frame(&mut mock, &bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_error_surfaces() {
        let mut mock = Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let err = write_frame(&mut mock, b"EMSG").await.unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
