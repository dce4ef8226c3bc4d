//! Declarative message fields
//!
//! A message class carries a table of [`FieldDescriptor`]s. Each descriptor
//! names a typed slot in the body, so `new_message(.., [("peer-id", 3u64.into())])`
//! can assign fields without the caller knowing the concrete body type.
//! The generic [`Record`] body stores one [`FieldValue`] per descriptor and
//! encodes them in declaration order.

use crate::error::{CodecError, CodecResult};
use crate::message::MessageBody;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Element kind of an array field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    U32,
    I32,
    U64,
    I64,
    F64,
}

/// Kind tag of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    U32,
    I32,
    U64,
    I64,
    F64,
    Str,
    Bytes,
    Array(ScalarKind),
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::U32 => "u32",
            ScalarKind::I32 => "i32",
            ScalarKind::U64 => "u64",
            ScalarKind::I64 => "i64",
            ScalarKind::F64 => "f64",
        };
        f.write_str(name)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::U32 => f.write_str("u32"),
            FieldKind::I32 => f.write_str("i32"),
            FieldKind::U64 => f.write_str("u64"),
            FieldKind::I64 => f.write_str("i64"),
            FieldKind::F64 => f.write_str("f64"),
            FieldKind::Str => f.write_str("string"),
            FieldKind::Bytes => f.write_str("bytes"),
            FieldKind::Array(elem) => write!(f, "array<{}>", elem),
        }
    }
}

impl FieldKind {
    /// Zero value for a freshly created body slot
    pub fn zero(self) -> FieldValue {
        match self {
            FieldKind::U32 => FieldValue::U32(0),
            FieldKind::I32 => FieldValue::I32(0),
            FieldKind::U64 => FieldValue::U64(0),
            FieldKind::I64 => FieldValue::I64(0),
            FieldKind::F64 => FieldValue::F64(0.0),
            FieldKind::Str => FieldValue::Str(String::new()),
            FieldKind::Bytes => FieldValue::Bytes(Vec::new()),
            FieldKind::Array(elem) => FieldValue::Array(ArrayValue::empty(elem)),
        }
    }

    /// Fixed encoded size, or the size of the length prefix for variable kinds
    pub fn min_encoded_len(self) -> usize {
        match self {
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 | FieldKind::I64 | FieldKind::F64 => 8,
            FieldKind::Str | FieldKind::Bytes | FieldKind::Array(_) => 4,
        }
    }
}

/// Homogeneous array of scalars
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl ArrayValue {
    pub fn empty(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::U32 => ArrayValue::U32(Vec::new()),
            ScalarKind::I32 => ArrayValue::I32(Vec::new()),
            ScalarKind::U64 => ArrayValue::U64(Vec::new()),
            ScalarKind::I64 => ArrayValue::I64(Vec::new()),
            ScalarKind::F64 => ArrayValue::F64(Vec::new()),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            ArrayValue::U32(_) => ScalarKind::U32,
            ArrayValue::I32(_) => ScalarKind::I32,
            ArrayValue::U64(_) => ScalarKind::U64,
            ArrayValue::I64(_) => ScalarKind::I64,
            ArrayValue::F64(_) => ScalarKind::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::U32(v) => v.len(),
            ArrayValue::I32(v) => v.len(),
            ArrayValue::U64(v) => v.len(),
            ArrayValue::I64(v) => v.len(),
            ArrayValue::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(ArrayValue),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::U32(_) => FieldKind::U32,
            FieldValue::I32(_) => FieldKind::I32,
            FieldValue::U64(_) => FieldKind::U64,
            FieldValue::I64(_) => FieldKind::I64,
            FieldValue::F64(_) => FieldKind::F64,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Bytes(_) => FieldKind::Bytes,
            FieldValue::Array(a) => FieldKind::Array(a.kind()),
        }
    }

    /// Unsigned view, widening u32
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U64(v) => Some(*v),
            FieldValue::U32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I64(v) => Some(*v),
            FieldValue::I32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Append the big-endian wire form of this value
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            FieldValue::U32(v) => out.put_u32(*v),
            FieldValue::I32(v) => out.put_i32(*v),
            FieldValue::U64(v) => out.put_u64(*v),
            FieldValue::I64(v) => out.put_i64(*v),
            FieldValue::F64(v) => out.put_f64(*v),
            FieldValue::Str(s) => {
                out.put_u32(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
            FieldValue::Bytes(b) => {
                out.put_u32(b.len() as u32);
                out.put_slice(b);
            }
            FieldValue::Array(a) => {
                out.put_u32(a.len() as u32);
                match a {
                    ArrayValue::U32(v) => v.iter().for_each(|x| out.put_u32(*x)),
                    ArrayValue::I32(v) => v.iter().for_each(|x| out.put_i32(*x)),
                    ArrayValue::U64(v) => v.iter().for_each(|x| out.put_u64(*x)),
                    ArrayValue::I64(v) => v.iter().for_each(|x| out.put_i64(*x)),
                    ArrayValue::F64(v) => v.iter().for_each(|x| out.put_f64(*x)),
                }
            }
        }
    }

    /// Read one value of `kind` from the cursor
    pub fn decode(kind: FieldKind, type_id: u32, cursor: &mut Cursor<&[u8]>) -> CodecResult<FieldValue> {
        let offset = cursor.position() as usize;
        let short = |_| CodecError::malformed(type_id, offset, format!("truncated {} field", kind));

        let value = match kind {
            FieldKind::U32 => FieldValue::U32(cursor.read_u32::<BigEndian>().map_err(short)?),
            FieldKind::I32 => FieldValue::I32(cursor.read_i32::<BigEndian>().map_err(short)?),
            FieldKind::U64 => FieldValue::U64(cursor.read_u64::<BigEndian>().map_err(short)?),
            FieldKind::I64 => FieldValue::I64(cursor.read_i64::<BigEndian>().map_err(short)?),
            FieldKind::F64 => FieldValue::F64(cursor.read_f64::<BigEndian>().map_err(short)?),
            FieldKind::Str => {
                let raw = read_len_prefixed(cursor, type_id)?;
                let s = String::from_utf8(raw)
                    .map_err(|e| CodecError::malformed(type_id, offset, format!("invalid utf-8: {}", e)))?;
                FieldValue::Str(s)
            }
            FieldKind::Bytes => FieldValue::Bytes(read_len_prefixed(cursor, type_id)?),
            FieldKind::Array(elem) => {
                let count = cursor.read_u32::<BigEndian>().map_err(short)? as usize;
                let elem_size = FieldKind::from(elem).min_encoded_len();
                let remaining = remaining(cursor);
                if count.saturating_mul(elem_size) > remaining {
                    return Err(CodecError::malformed(
                        type_id,
                        offset,
                        format!("array of {} x {} exceeds {} remaining bytes", count, elem, remaining),
                    ));
                }
                let array = match elem {
                    ScalarKind::U32 => ArrayValue::U32(
                        (0..count).map(|_| cursor.read_u32::<BigEndian>()).collect::<Result<_, _>>().map_err(short)?,
                    ),
                    ScalarKind::I32 => ArrayValue::I32(
                        (0..count).map(|_| cursor.read_i32::<BigEndian>()).collect::<Result<_, _>>().map_err(short)?,
                    ),
                    ScalarKind::U64 => ArrayValue::U64(
                        (0..count).map(|_| cursor.read_u64::<BigEndian>()).collect::<Result<_, _>>().map_err(short)?,
                    ),
                    ScalarKind::I64 => ArrayValue::I64(
                        (0..count).map(|_| cursor.read_i64::<BigEndian>()).collect::<Result<_, _>>().map_err(short)?,
                    ),
                    ScalarKind::F64 => ArrayValue::F64(
                        (0..count).map(|_| cursor.read_f64::<BigEndian>()).collect::<Result<_, _>>().map_err(short)?,
                    ),
                };
                FieldValue::Array(array)
            }
        };
        Ok(value)
    }
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn read_len_prefixed(cursor: &mut Cursor<&[u8]>, type_id: u32) -> CodecResult<Vec<u8>> {
    let offset = cursor.position() as usize;
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| CodecError::malformed(type_id, offset, "truncated length prefix"))? as usize;
    if len > remaining(cursor) {
        return Err(CodecError::malformed(
            type_id,
            offset,
            format!("length {} exceeds {} remaining bytes", len, remaining(cursor)),
        ));
    }
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| CodecError::malformed(type_id, offset, "truncated data"))?;
    Ok(buf)
}

impl From<ScalarKind> for FieldKind {
    fn from(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::U32 => FieldKind::U32,
            ScalarKind::I32 => FieldKind::I32,
            ScalarKind::U64 => FieldKind::U64,
            ScalarKind::I64 => FieldKind::I64,
            ScalarKind::F64 => FieldKind::F64,
        }
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U32(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<Vec<u32>> for FieldValue {
    fn from(v: Vec<u32>) -> Self {
        FieldValue::Array(ArrayValue::U32(v))
    }
}

impl From<Vec<u64>> for FieldValue {
    fn from(v: Vec<u64>) -> Self {
        FieldValue::Array(ArrayValue::U64(v))
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self {
        FieldValue::Array(ArrayValue::F64(v))
    }
}

/// Custom setter replacing the default slot assignment
pub type FieldSetter = Arc<dyn Fn(&mut dyn MessageBody, FieldValue) -> CodecResult<()> + Send + Sync>;

/// Named, typed field of a message class
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    kind: FieldKind,
    slot: usize,
    setter: Option<FieldSetter>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind, slot: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            slot,
            setter: None,
        }
    }

    /// Route assignments through a custom setter
    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&mut dyn MessageBody, FieldValue) -> CodecResult<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Assign a value to this field of `body`
    ///
    /// The value kind must match the declared kind; a custom setter, if
    /// present, receives the value instead of the body's own `assign`.
    pub fn apply(&self, body: &mut dyn MessageBody, value: FieldValue) -> CodecResult<()> {
        if value.kind() != self.kind {
            return Err(CodecError::field_kind_mismatch(&self.name, self.kind, value.kind()));
        }
        match &self.setter {
            Some(setter) => setter(body, value),
            None => body.assign(self, value),
        }
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .field("custom_setter", &self.setter.is_some())
            .finish()
    }
}

/// Build a descriptor table with slots numbered in declaration order
pub fn field_table(fields: &[(&str, FieldKind)]) -> Vec<FieldDescriptor> {
    fields
        .iter()
        .enumerate()
        .map(|(slot, (name, kind))| FieldDescriptor::new(*name, *kind, slot))
        .collect()
}

/// Generic declarative body: one value per declared field
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    slots: Vec<FieldValue>,
}

impl Record {
    /// Zero-initialized record for a descriptor table
    pub fn from_fields(fields: &[FieldDescriptor]) -> Self {
        let mut slots = vec![FieldValue::U32(0); fields.len()];
        for field in fields {
            if let Some(slot) = slots.get_mut(field.slot()) {
                *slot = field.kind().zero();
            }
        }
        Self { slots }
    }

    pub fn get(&self, slot: usize) -> Option<&FieldValue> {
        self.slots.get(slot)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.slots
    }

    /// Overwrite a slot, keeping its kind
    pub fn set(&mut self, slot: usize, value: FieldValue) -> CodecResult<()> {
        let current = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| CodecError::field_kind_mismatch(format!("slot {}", slot), "a declared slot", "none"))?;
        if current.kind() != value.kind() {
            return Err(CodecError::field_kind_mismatch(
                format!("slot {}", slot),
                current.kind(),
                value.kind(),
            ));
        }
        *current = value;
        Ok(())
    }
}

impl MessageBody for Record {
    fn encode_payload(&self, out: &mut BytesMut) {
        for value in &self.slots {
            value.encode(out);
        }
    }

    fn decode_payload(&mut self, type_id: u32, payload: &[u8]) -> CodecResult<()> {
        let mut cursor = Cursor::new(payload);
        for slot in self.slots.iter_mut() {
            *slot = FieldValue::decode(slot.kind(), type_id, &mut cursor)?;
        }
        Ok(())
    }

    fn clone_body(&self) -> Box<dyn MessageBody> {
        Box::new(self.clone())
    }

    fn assign(&mut self, field: &FieldDescriptor, value: FieldValue) -> CodecResult<()> {
        self.set(field.slot(), value)
            .map_err(|_| CodecError::field_kind_mismatch(field.name(), field.kind(), "an undeclared slot"))
    }
}
