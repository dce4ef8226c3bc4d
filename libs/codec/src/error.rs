//! Codec-level errors for message registration, framing and payload decoding
//!
//! Every variant carries enough context (type id, byte counts, field name) to
//! tell from a single log line which message was rejected and why.

use thiserror::Error;

/// Errors raised by the message registry and wire codec
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// A class for this type id already exists in the registry
    #[error("Message type {type_id:#010x} is already registered (existing class: {existing})")]
    TypeAlreadyRegistered { type_id: u32, existing: String },

    /// No class is registered for this type id
    #[error("Unknown message type {type_id:#010x}: register a class before encoding or decoding it")]
    UnknownType { type_id: u32 },

    /// Frame does not start with the registry's magic tag
    #[error("Invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Buffer is shorter than the structure being parsed
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Payload is shorter than the class minimum
    #[error("Payload too small for type {type_id:#010x}: need {need} bytes, got {got}")]
    PayloadTooSmall { type_id: u32, need: usize, got: usize },

    /// Declared payload exceeds the accepted maximum
    #[error("Payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Copy between messages of different types
    #[error("Message type mismatch: destination {expected:#010x}, source {got:#010x}")]
    TypeMismatch { expected: u32, got: u32 },

    /// A field value of the wrong kind was assigned
    #[error("Field '{field}' expects {expected}, got {got}")]
    FieldKindMismatch {
        field: String,
        expected: String,
        got: String,
    },

    /// The class has no field with this name
    #[error("Message type {type_id:#010x} has no field '{field}'")]
    UnknownField { type_id: u32, field: String },

    /// Payload bytes could not be decoded into the body
    #[error("Malformed payload for type {type_id:#010x} at offset {offset}: {reason}")]
    Malformed {
        type_id: u32,
        offset: usize,
        reason: String,
    },
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Create a MessageTooSmall error with parsing context
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create a Malformed error for a payload decoder
    pub fn malformed(type_id: u32, offset: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            type_id,
            offset,
            reason: reason.into(),
        }
    }

    /// Create a FieldKindMismatch error
    pub fn field_kind_mismatch(
        field: impl Into<String>,
        expected: impl std::fmt::Display,
        got: impl std::fmt::Display,
    ) -> Self {
        Self::FieldKindMismatch {
            field: field.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// True for errors that only affect one message and leave the stream usable
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PayloadTooLarge { .. } | Self::MessageTooSmall { .. })
    }
}
