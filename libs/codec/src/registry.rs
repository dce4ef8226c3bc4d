//! Message type registry and wire codec
//!
//! The registry maps a type id to its [`MessageClass`]: a body factory, the
//! minimum payload size and the named field table. It is an explicit instance
//! shared as `Arc<MessageRegistry>`; every communicator and peer that talks
//! the same protocol holds the same registry.
//!
//! ## Encoding
//!
//! `encode` writes the 28-byte big-endian header, then lets the body append
//! its payload, then patches the payload length into the header.
//!
//! ## Decoding
//!
//! Decoding is split in two so stream readers can size their second read:
//! `decode_header` verifies the magic tag, resolves the class and creates a
//! zero-initialized body; `decode_payload` checks the class minimum and fills
//! the body.

use crate::builtin::builtin_classes;
use crate::constants::{DEFAULT_MAGIC, HEADER_SIZE, MAX_PAYLOAD_SIZE, PAYLOAD_LEN_OFFSET};
use crate::error::{CodecError, CodecResult};
use crate::fields::{field_table, FieldDescriptor, FieldKind, FieldValue, Record};
use crate::message::{Message, MessageBody};
use crate::parser::FrameHeader;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Factory producing a zero-initialized body
pub type BodyFactory = Arc<dyn Fn() -> Box<dyn MessageBody> + Send + Sync>;

/// Registry entry describing one message type
#[derive(Clone)]
pub struct MessageClass {
    type_id: u32,
    name: String,
    min_payload: usize,
    factory: BodyFactory,
    fields: Vec<FieldDescriptor>,
}

impl MessageClass {
    pub fn new<F>(type_id: u32, name: impl Into<String>, min_payload: usize, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MessageBody> + Send + Sync + 'static,
    {
        Self {
            type_id,
            name: name.into(),
            min_payload,
            factory: Arc::new(factory),
            fields: Vec::new(),
        }
    }

    /// Class whose body is a [`Record`] built from the field list
    ///
    /// The minimum payload is the sum of the fixed sizes (length prefixes
    /// for variable fields).
    pub fn record(type_id: u32, name: impl Into<String>, fields: &[(&str, FieldKind)]) -> Self {
        let table = field_table(fields);
        let min_payload = table.iter().map(|f| f.kind().min_encoded_len()).sum();
        let template = Record::from_fields(&table);
        Self::new(type_id, name, min_payload, move || Box::new(template.clone())).with_fields(table)
    }

    /// Replace the field table
    pub fn with_fields(mut self, fields: Vec<FieldDescriptor>) -> Self {
        self.fields = fields;
        self
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_payload(&self) -> usize {
        self.min_payload
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn create_body(&self) -> Box<dyn MessageBody> {
        (self.factory)()
    }
}

impl fmt::Debug for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageClass")
            .field("type_id", &format_args!("{:#010x}", self.type_id))
            .field("name", &self.name)
            .field("min_payload", &self.min_payload)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Type id to class mapping plus the frame magic tag
pub struct MessageRegistry {
    magic: [u8; 4],
    classes: RwLock<HashMap<u32, Arc<MessageClass>>>,
}

impl MessageRegistry {
    /// Registry using the default `EMSG` magic, with built-in types registered
    pub fn new() -> Self {
        Self::with_magic(DEFAULT_MAGIC)
    }

    /// Registry using a custom magic tag, with built-in types registered
    pub fn with_magic(magic: [u8; 4]) -> Self {
        let mut classes = HashMap::new();
        for class in builtin_classes() {
            classes.insert(class.type_id(), Arc::new(class));
        }
        Self {
            magic,
            classes: RwLock::new(classes),
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Add a class; a type id may be registered only once
    pub fn register_type(&self, class: MessageClass) -> CodecResult<()> {
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(&class.type_id()) {
            warn!(
                type_id = format_args!("{:#010x}", class.type_id()),
                existing = existing.name(),
                rejected = class.name(),
                "Message type already registered"
            );
            return Err(CodecError::TypeAlreadyRegistered {
                type_id: class.type_id(),
                existing: existing.name().to_string(),
            });
        }
        debug!(
            type_id = format_args!("{:#010x}", class.type_id()),
            name = class.name(),
            "Registered message type"
        );
        classes.insert(class.type_id(), Arc::new(class));
        Ok(())
    }

    pub fn class(&self, type_id: u32) -> Option<Arc<MessageClass>> {
        self.classes.read().get(&type_id).cloned()
    }

    pub fn is_registered(&self, type_id: u32) -> bool {
        self.classes.read().contains_key(&type_id)
    }

    /// Number of registered classes, built-ins included
    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    fn require(&self, type_id: u32) -> CodecResult<Arc<MessageClass>> {
        self.class(type_id).ok_or(CodecError::UnknownType { type_id })
    }

    /// Create a zero-initialized message and apply named field values
    ///
    /// A name that the class does not declare, or a value of the wrong kind,
    /// is logged and skipped; the message is still returned.
    pub fn new_message<I, S>(
        &self,
        type_id: u32,
        recipient_id: u64,
        sender_id: u64,
        fields: I,
    ) -> CodecResult<Message>
    where
        I: IntoIterator<Item = (S, FieldValue)>,
        S: AsRef<str>,
    {
        let class = self.require(type_id)?;
        let mut msg = Message::new(type_id, recipient_id, sender_id, class.create_body());
        for (name, value) in fields {
            let name = name.as_ref();
            if let Err(e) = apply_field(&class, &mut msg, name, value) {
                warn!(
                    type_id = format_args!("{:#010x}", type_id),
                    field = name,
                    error = %e,
                    "Skipping field assignment"
                );
            }
        }
        Ok(msg)
    }

    /// Set one field by name; "sender-id" and "recipient-id" set the header
    pub fn set_field(&self, msg: &mut Message, name: &str, value: FieldValue) -> CodecResult<()> {
        match name {
            "sender-id" | "recipient-id" => {
                let id = value
                    .as_u64()
                    .ok_or_else(|| CodecError::field_kind_mismatch(name, FieldKind::U64, value.kind()))?;
                if name == "sender-id" {
                    msg.sender_id = id;
                } else {
                    msg.recipient_id = id;
                }
                Ok(())
            }
            _ => {
                let class = self.require(msg.type_id)?;
                apply_field(&class, msg, name, value)
            }
        }
    }

    /// Encode a full frame
    pub fn encode(&self, msg: &Message) -> CodecResult<Bytes> {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + 64);
        self.encode_into(msg, &mut out)?;
        Ok(out.freeze())
    }

    /// Append a full frame to `out`
    pub fn encode_into(&self, msg: &Message, out: &mut BytesMut) -> CodecResult<()> {
        if !self.is_registered(msg.type_id) {
            return Err(CodecError::UnknownType { type_id: msg.type_id });
        }

        let start = out.len();
        FrameHeader {
            magic: self.magic,
            type_id: msg.type_id,
            recipient_id: msg.recipient_id,
            sender_id: msg.sender_id,
            payload_len: 0,
        }
        .write(out);
        msg.encode_payload(out);

        let payload_len = out.len() - start - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            out.truncate(start);
            return Err(CodecError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let len_at = start + PAYLOAD_LEN_OFFSET;
        BigEndian::write_u32(&mut out[len_at..len_at + 4], payload_len as u32);
        Ok(())
    }

    /// Parse a header and create the matching zero-initialized message
    ///
    /// Returns the message and the declared payload length.
    pub fn decode_header(&self, data: &[u8]) -> CodecResult<(Message, usize)> {
        let header = FrameHeader::parse(data, self.magic)?;
        let msg = self.message_for_header(&header)?;
        Ok((msg, header.payload_len()))
    }

    /// Create the message for an already parsed header
    pub fn message_for_header(&self, header: &FrameHeader) -> CodecResult<Message> {
        let class = self.require(header.type_id)?;
        Ok(Message::new(
            header.type_id,
            header.recipient_id,
            header.sender_id,
            class.create_body(),
        ))
    }

    /// Fill the body of a message created by `decode_header`
    pub fn decode_payload(&self, msg: &mut Message, payload: &[u8]) -> CodecResult<()> {
        let class = self.require(msg.type_id)?;
        if payload.len() < class.min_payload() {
            return Err(CodecError::PayloadTooSmall {
                type_id: msg.type_id,
                need: class.min_payload(),
                got: payload.len(),
            });
        }
        let type_id = msg.type_id;
        msg.body_mut().decode_payload(type_id, payload)
    }

    /// Decode a complete frame
    pub fn decode(&self, data: &[u8]) -> CodecResult<Message> {
        let (mut msg, payload_len) = self.decode_header(data)?;
        let end = HEADER_SIZE + payload_len;
        if data.len() < end {
            return Err(CodecError::message_too_small(end, data.len(), "frame payload"));
        }
        self.decode_payload(&mut msg, &data[HEADER_SIZE..end])?;
        Ok(msg)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("magic", &String::from_utf8_lossy(&self.magic))
            .field("types", &self.len())
            .finish()
    }
}

fn apply_field(class: &MessageClass, msg: &mut Message, name: &str, value: FieldValue) -> CodecResult<()> {
    let field = class.field(name).ok_or_else(|| CodecError::UnknownField {
        type_id: class.type_id(),
        field: name.to_string(),
    })?;
    field.apply(msg.body_mut(), value)
}
