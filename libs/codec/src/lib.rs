//! # EMSG Message Codec
//!
//! ## Purpose
//!
//! Typed message model and wire format for the EMSG peer protocol. This crate
//! is the "rules" layer: it knows what a message looks like on the wire and
//! how each registered type encodes its payload. It has no knowledge of
//! sockets or threads.
//!
//! ## Wire Format
//!
//! ```text
//! magic(4) | type(4) | recipient_id(8) | sender_id(8) | payload_len(4) | payload
//! ```
//!
//! All header integers are big-endian. Recipient `0` is the master and
//! `u64::MAX` is broadcast.
//!
//! ## Components
//!
//! - [`MessageRegistry`]: type id to [`MessageClass`] mapping, encode/decode
//! - [`Message`] and the [`MessageBody`] trait
//! - [`Record`] and [`FieldDescriptor`]: declarative field tables
//! - [`FrameHeader`]: raw header parse used by stream readers
//! - [`builtin`]: internal and status message types
//!
//! ## Example
//!
//! ```rust
//! use emsg_codec::{FieldKind, FieldValue, MessageClass, MessageRegistry};
//!
//! let registry = MessageRegistry::new();
//! registry
//!     .register_type(MessageClass::record(0x10, "text", &[("text", FieldKind::Str)]))
//!     .unwrap();
//!
//! let msg = registry
//!     .new_message(0x10, 0, 3, [("text", FieldValue::from("hello"))])
//!     .unwrap();
//! let bytes = registry.encode(&msg).unwrap();
//! let decoded = registry.decode(&bytes).unwrap();
//! assert_eq!(decoded.sender_id, 3);
//! ```

pub mod builtin;
pub mod constants;
pub mod error;
pub mod fields;
pub mod message;
pub mod parser;
pub mod registry;

pub use builtin::{types, Empty, PeerChangedBody, PeerIdBody, PeerStatus};
pub use constants::*;
pub use error::{CodecError, CodecResult};
pub use fields::{
    field_table, ArrayValue, FieldDescriptor, FieldKind, FieldSetter, FieldValue, Record, ScalarKind,
};
pub use message::{Message, MessageBody};
pub use parser::FrameHeader;
pub use registry::{BodyFactory, MessageClass, MessageRegistry};
