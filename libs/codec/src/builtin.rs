//! Built-in internal and status message types
//!
//! Internal types (top bit set) drive the peer protocol: id assignment, the
//! leave/terminate handshake and connection bookkeeping. Status types (bit 30)
//! are generated locally and delivered to the application; they never travel
//! over the wire.

use crate::error::{CodecError, CodecResult};
use crate::fields::{FieldDescriptor, FieldKind, FieldValue};
use crate::message::MessageBody;
use crate::registry::{MessageClass, MessageRegistry};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

/// Reserved type ids
pub mod types {
    /// Master assigns a slave its id ("peer-id")
    pub const SET_ID: u32 = 0x8000_0001;
    /// Slave announces it is leaving
    pub const LEAVE: u32 = 0x8000_0002;
    /// Master asks every slave to terminate
    pub const TERM: u32 = 0x8000_0003;
    /// Slave acknowledges TERM
    pub const TERM_ACK: u32 = 0x8000_0004;
    /// A data connection was registered ("remote-id"), local only
    pub const CONNECTION_ADD: u32 = 0x8000_0005;
    /// A data connection was torn down ("remote-id"), local only
    pub const CONNECTION_DEL: u32 = 0x8000_0006;
    /// Sentinel returned by a disabled queue
    pub const QUEUE_DISABLED: u32 = 0x8000_0007;

    /// Connection set or id changed ("peer-status", "remote-id")
    pub const PEER_CHANGED: u32 = 0x4000_0001;
    /// The peer has its id and can send
    pub const PEER_READY: u32 = 0x4000_0002;
}

/// Body with no payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl MessageBody for Empty {
    fn encode_payload(&self, _out: &mut BytesMut) {}

    fn decode_payload(&mut self, _type_id: u32, _payload: &[u8]) -> CodecResult<()> {
        Ok(())
    }

    fn clone_body(&self) -> Box<dyn MessageBody> {
        Box::new(*self)
    }
}

/// Single 8-byte id payload, used by SET_ID and the connection events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerIdBody {
    pub peer_id: u64,
}

impl PeerIdBody {
    pub fn new(peer_id: u64) -> Self {
        Self { peer_id }
    }
}

impl MessageBody for PeerIdBody {
    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u64(self.peer_id);
    }

    fn decode_payload(&mut self, type_id: u32, payload: &[u8]) -> CodecResult<()> {
        if payload.len() < 8 {
            return Err(CodecError::PayloadTooSmall {
                type_id,
                need: 8,
                got: payload.len(),
            });
        }
        self.peer_id = BigEndian::read_u64(payload);
        Ok(())
    }

    fn clone_body(&self) -> Box<dyn MessageBody> {
        Box::new(*self)
    }

    fn assign(&mut self, _field: &FieldDescriptor, value: FieldValue) -> CodecResult<()> {
        if let Some(id) = value.as_u64() {
            self.peer_id = id;
        }
        Ok(())
    }
}

/// Value of the "peer-status" field of PEER_CHANGED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerStatus {
    ConnectionAdded = 1,
    ConnectionDeleted = 2,
    IdChanged = 3,
}

impl TryFrom<u32> for PeerStatus {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PeerStatus::ConnectionAdded),
            2 => Ok(PeerStatus::ConnectionDeleted),
            3 => Ok(PeerStatus::IdChanged),
            other => Err(other),
        }
    }
}

/// PEER_CHANGED payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerChangedBody {
    pub peer_status: u32,
    pub remote_id: u64,
}

impl PeerChangedBody {
    pub fn new(status: PeerStatus, remote_id: u64) -> Self {
        Self {
            peer_status: status as u32,
            remote_id,
        }
    }

    pub fn status(&self) -> Option<PeerStatus> {
        PeerStatus::try_from(self.peer_status).ok()
    }
}

impl MessageBody for PeerChangedBody {
    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u32(self.peer_status);
        out.put_u64(self.remote_id);
    }

    fn decode_payload(&mut self, type_id: u32, payload: &[u8]) -> CodecResult<()> {
        if payload.len() < 12 {
            return Err(CodecError::PayloadTooSmall {
                type_id,
                need: 12,
                got: payload.len(),
            });
        }
        self.peer_status = BigEndian::read_u32(payload);
        self.remote_id = BigEndian::read_u64(&payload[4..]);
        Ok(())
    }

    fn clone_body(&self) -> Box<dyn MessageBody> {
        Box::new(*self)
    }

    fn assign(&mut self, field: &FieldDescriptor, value: FieldValue) -> CodecResult<()> {
        match (field.slot(), value) {
            (0, FieldValue::U32(status)) => self.peer_status = status,
            (1, FieldValue::U64(remote)) => self.remote_id = remote,
            (_, other) => {
                return Err(CodecError::field_kind_mismatch(field.name(), field.kind(), other.kind()))
            }
        }
        Ok(())
    }
}

fn id_class(type_id: u32, name: &str, field: &str) -> MessageClass {
    MessageClass::new(type_id, name, 8, || Box::new(PeerIdBody::default()))
        .with_fields(vec![FieldDescriptor::new(field, FieldKind::U64, 0)])
}

fn empty_class(type_id: u32, name: &str) -> MessageClass {
    MessageClass::new(type_id, name, 0, || Box::new(Empty))
}

/// Classes registered by every new registry
pub(crate) fn builtin_classes() -> Vec<MessageClass> {
    vec![
        id_class(types::SET_ID, "set-id", "peer-id"),
        empty_class(types::LEAVE, "leave"),
        empty_class(types::TERM, "term"),
        empty_class(types::TERM_ACK, "term-ack"),
        id_class(types::CONNECTION_ADD, "connection-add", "remote-id"),
        id_class(types::CONNECTION_DEL, "connection-del", "remote-id"),
        empty_class(types::QUEUE_DISABLED, "queue-disabled"),
        MessageClass::new(types::PEER_CHANGED, "peer-changed", 12, || {
            Box::new(PeerChangedBody::default())
        })
        .with_fields(vec![
            FieldDescriptor::new("peer-status", FieldKind::U32, 0),
            FieldDescriptor::new("remote-id", FieldKind::U64, 1),
        ]),
        empty_class(types::PEER_READY, "peer-ready"),
    ]
}

/// Convenience constructors for the built-in messages
impl MessageRegistry {
    pub fn set_id(&self, recipient_id: u64, sender_id: u64, peer_id: u64) -> crate::Message {
        crate::Message::new(types::SET_ID, recipient_id, sender_id, Box::new(PeerIdBody::new(peer_id)))
    }

    pub fn control(&self, type_id: u32, recipient_id: u64, sender_id: u64) -> crate::Message {
        crate::Message::new(type_id, recipient_id, sender_id, Box::new(Empty))
    }

    pub fn connection_event(&self, type_id: u32, remote_id: u64) -> crate::Message {
        crate::Message::new(type_id, 0, remote_id, Box::new(PeerIdBody::new(remote_id)))
    }

    pub fn peer_changed(&self, recipient_id: u64, status: PeerStatus, remote_id: u64) -> crate::Message {
        crate::Message::new(
            types::PEER_CHANGED,
            recipient_id,
            recipient_id,
            Box::new(PeerChangedBody::new(status, remote_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_are_reserved() {
        for class in builtin_classes() {
            assert!(
                crate::is_internal(class.type_id()) || crate::is_status(class.type_id()),
                "{} is in the application range",
                class.name()
            );
        }
    }

    #[test]
    fn test_peer_changed_fields_by_name() {
        let registry = MessageRegistry::new();
        let msg = registry
            .new_message(
                types::PEER_CHANGED,
                1,
                1,
                [("peer-status", FieldValue::U32(2)), ("remote-id", FieldValue::U64(4))],
            )
            .unwrap();
        let body = msg.body_as::<PeerChangedBody>().unwrap();
        assert_eq!(body.status(), Some(PeerStatus::ConnectionDeleted));
        assert_eq!(body.remote_id, 4);
    }

    #[test]
    fn test_set_id_payload_too_small() {
        let mut body = PeerIdBody::default();
        let err = body.decode_payload(types::SET_ID, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooSmall { need: 8, got: 3, .. }));
    }
}
