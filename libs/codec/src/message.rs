//! Message envelope and the body trait
//!
//! A [`Message`] is the generic header (type, recipient, sender) plus a typed
//! body. Bodies are trait objects implementing [`MessageBody`]: they know how
//! to write and read their own payload, deep-copy themselves and accept typed
//! field assignments from the registry's field table.
//!
//! Ownership is single: handing a message to a queue or a communicator moves
//! it. Callers that want to keep using a message clone it first; `Clone` is a
//! deep copy through [`MessageBody::clone_body`].

use crate::constants::{is_internal, is_status, RECIPIENT_ALL};
use crate::error::{CodecError, CodecResult};
use crate::fields::FieldDescriptor;
use bytes::BytesMut;
use std::any::Any;
use std::fmt;

/// Downcast support for message bodies
pub trait BodyAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> BodyAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Type-specific payload behavior
pub trait MessageBody: BodyAny + Send + Sync + fmt::Debug {
    /// Append the payload bytes for this body
    fn encode_payload(&self, out: &mut BytesMut);

    /// Replace the body contents from payload bytes
    fn decode_payload(&mut self, type_id: u32, payload: &[u8]) -> CodecResult<()>;

    /// Deep copy, including any owned secondary allocations
    fn clone_body(&self) -> Box<dyn MessageBody>;

    /// Typed assignment of one declared field
    fn assign(&mut self, field: &FieldDescriptor, _value: crate::FieldValue) -> CodecResult<()> {
        Err(CodecError::field_kind_mismatch(
            field.name(),
            field.kind(),
            "a body without assignable fields",
        ))
    }
}

impl<'a> dyn MessageBody + 'a {
    /// Borrow the concrete body type
    pub fn downcast_ref<T: MessageBody + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the concrete body type
    pub fn downcast_mut<T: MessageBody + 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

impl Clone for Box<dyn MessageBody> {
    fn clone(&self) -> Self {
        self.as_ref().clone_body()
    }
}

/// A typed message with routing header
#[derive(Debug, Clone)]
pub struct Message {
    /// Application-defined type id (internal types have the top bit set)
    pub type_id: u32,
    /// Destination peer id, 0 for the master, `RECIPIENT_ALL` for broadcast
    pub recipient_id: u64,
    /// Originating peer id
    pub sender_id: u64,
    body: Box<dyn MessageBody>,
}

impl Message {
    /// Assemble a message from header fields and a body
    pub fn new(type_id: u32, recipient_id: u64, sender_id: u64, body: Box<dyn MessageBody>) -> Self {
        Self {
            type_id,
            recipient_id,
            sender_id,
            body,
        }
    }

    pub fn body(&self) -> &dyn MessageBody {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> &mut dyn MessageBody {
        self.body.as_mut()
    }

    /// Borrow the body as its concrete type
    pub fn body_as<T: MessageBody + 'static>(&self) -> Option<&T> {
        self.body.as_ref().downcast_ref::<T>()
    }

    /// Mutably borrow the body as its concrete type
    pub fn body_as_mut<T: MessageBody + 'static>(&mut self) -> Option<&mut T> {
        self.body.as_mut().downcast_mut::<T>()
    }

    pub fn is_internal(&self) -> bool {
        is_internal(self.type_id)
    }

    pub fn is_status(&self) -> bool {
        is_status(self.type_id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == RECIPIENT_ALL
    }

    /// Encode only the payload section
    pub fn encode_payload(&self, out: &mut BytesMut) {
        self.body.encode_payload(out)
    }

    /// Copy header and a deep copy of the body from a message of the same type
    pub fn copy_from(&mut self, src: &Message) -> CodecResult<()> {
        if self.type_id != src.type_id {
            return Err(CodecError::TypeMismatch {
                expected: self.type_id,
                got: src.type_id,
            });
        }
        self.recipient_id = src.recipient_id;
        self.sender_id = src.sender_id;
        self.body = src.body.clone();
        Ok(())
    }

    /// Independent duplicate of this message
    pub fn dup(&self) -> Message {
        self.clone()
    }
}
