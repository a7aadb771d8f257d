//! Payload encoding and zero-copy validation
//!
//! ## Payload Format
//!
//! ```text
//! +---------------+---------------------------+----------------------+
//! | fixed_len u16 | fixed section (fixed_len) | heap (variable data) |
//! +---------------+---------------------------+----------------------+
//! ```
//!
//! All integers are little-endian. Variable-length fields store
//! `(heap_offset: u32, len: u32)` in their fixed slot.
//!
//! Validation walks the layout's field table over the borrowed payload and
//! never allocates; decoding into an owned [`Record`] is a separate step.

use std::sync::Arc;

use crate::error::{Result, SchemaError};
use crate::layout::{FieldDef, FieldType, Layout, Version, FIXED_LEN_PREFIX};
use crate::value::{Record, Value};

/// Borrowed view of one field inside a validated payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Bytes(&'a [u8]),
    Str(&'a str),
}

impl FieldRef<'_> {
    pub fn to_value(self) -> Value {
        match self {
            FieldRef::U8(v) => Value::U8(v),
            FieldRef::U16(v) => Value::U16(v),
            FieldRef::U32(v) => Value::U32(v),
            FieldRef::U64(v) => Value::U64(v),
            FieldRef::I32(v) => Value::I32(v),
            FieldRef::I64(v) => Value::I64(v),
            FieldRef::F64(v) => Value::F64(v),
            FieldRef::Bool(v) => Value::Bool(v),
            FieldRef::Bytes(v) => Value::Bytes(v.to_vec()),
            FieldRef::Str(v) => Value::String(v.to_string()),
        }
    }
}

/// A payload that passed validation against a layout
#[derive(Debug, Clone)]
pub struct DecodedMessage<'a> {
    layout: Arc<Layout>,
    version: Version,
    fixed: &'a [u8],
    heap: &'a [u8],
    /// Leading fields present in the payload
    present: usize,
    /// Heap bytes referenced by interpreted fields
    heap_used: usize,
}

impl<'a> DecodedMessage<'a> {
    #[inline]
    pub fn schema_id(&self) -> u32 {
        self.layout.schema_id()
    }

    /// Version the payload was written with
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Layout the payload was interpreted with
    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Read a field; `None` when the payload predates it or it does not exist
    pub fn get(&self, name: &str) -> Option<FieldRef<'a>> {
        let (idx, field) = self.layout.field(name)?;
        if idx >= self.present {
            return None;
        }
        read_field(field, self.fixed, self.heap)
    }

    /// Interpreted fields in layout order
    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldRef<'a>)> + '_ {
        self.layout.fields()[..self.present]
            .iter()
            .filter_map(|f| read_field(f, self.fixed, self.heap).map(|v| (f.name.as_str(), v)))
    }

    pub fn str(&self, name: &str) -> Option<&'a str> {
        match self.get(name)? {
            FieldRef::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&'a [u8]> {
        match self.get(name)? {
            FieldRef::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Any unsigned integer field widened to `u64`
    pub fn u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            FieldRef::U8(v) => Some(v as u64),
            FieldRef::U16(v) => Some(v as u64),
            FieldRef::U32(v) => Some(v as u64),
            FieldRef::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            FieldRef::I32(v) => Some(v as i64),
            FieldRef::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            FieldRef::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            FieldRef::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Fixed-section bytes written by a newer minor version
    pub fn trailing_fixed(&self) -> &'a [u8] {
        let known = (self.layout.fixed_len() as usize).min(self.fixed.len());
        &self.fixed[known..]
    }

    /// Heap bytes not referenced by any interpreted field
    pub fn trailing_heap(&self) -> &'a [u8] {
        &self.heap[self.heap_used.min(self.heap.len())..]
    }

    /// Copy the interpreted fields into an owned record
    pub fn to_record(&self) -> Record {
        self.fields()
            .map(|(name, value)| (name.to_string(), value.to_value()))
            .collect()
    }
}

/// Encode a record with `layout`
///
/// Every field of the layout must be present with a matching type, and the
/// record may not carry fields the layout lacks.
pub fn encode(layout: &Layout, record: &Record) -> Result<Vec<u8>> {
    let id = layout.schema_id();
    if let Some((name, _)) = record.iter().find(|(n, _)| layout.field(n).is_none()) {
        return Err(SchemaError::mismatch(
            id,
            format!("field {name:?} is not part of v{}", layout.version()),
        ));
    }

    let mut fixed = vec![0u8; layout.fixed_len() as usize];
    let mut heap = Vec::new();

    for field in layout.fields() {
        let value = record
            .get(&field.name)
            .ok_or_else(|| SchemaError::mismatch(id, format!("missing field {:?}", field.name)))?;
        if !value.fits(field.ty) {
            return Err(SchemaError::mismatch(
                id,
                format!(
                    "field {:?} is {}, got {}",
                    field.name,
                    field.ty,
                    value.type_name()
                ),
            ));
        }

        let slot = &mut fixed[field.offset as usize..field.end()];
        match value {
            Value::U8(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::U16(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::U32(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::U64(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::I32(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::I64(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::F64(v) => slot.copy_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => slot[0] = u8::from(*v),
            Value::Bytes(b) if field.ty == FieldType::Bytes => {
                write_heap_slot(id, slot, &mut heap, b)?
            }
            Value::Bytes(b) => slot.copy_from_slice(b),
            Value::String(s) => write_heap_slot(id, slot, &mut heap, s.as_bytes())?,
        }
    }

    let mut out = Vec::with_capacity(FIXED_LEN_PREFIX + fixed.len() + heap.len());
    out.extend_from_slice(&layout.fixed_len().to_le_bytes());
    out.extend_from_slice(&fixed);
    out.extend_from_slice(&heap);
    Ok(out)
}

fn write_heap_slot(id: u32, slot: &mut [u8], heap: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let too_big = || SchemaError::mismatch(id, "variable-length data exceeds 4 GiB");
    let offset = u32::try_from(heap.len()).map_err(|_| too_big())?;
    let len = u32::try_from(data.len()).map_err(|_| too_big())?;
    slot[..4].copy_from_slice(&offset.to_le_bytes());
    slot[4..8].copy_from_slice(&len.to_le_bytes());
    heap.extend_from_slice(data);
    Ok(())
}

/// Check `payload`, written at `version`, against `layout`
///
/// `layout` must share the payload's major version; the registry picks it.
pub fn validate<'a>(
    layout: Arc<Layout>,
    version: Version,
    payload: &'a [u8],
) -> Result<DecodedMessage<'a>> {
    let id = layout.schema_id();
    if payload.len() < FIXED_LEN_PREFIX {
        return Err(SchemaError::mismatch(id, "payload shorter than its length prefix"));
    }
    let fixed_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let body = &payload[FIXED_LEN_PREFIX..];
    if body.len() < fixed_len {
        return Err(SchemaError::mismatch(
            id,
            format!("fixed section declares {fixed_len} bytes, only {} present", body.len()),
        ));
    }
    let (fixed, heap) = body.split_at(fixed_len);

    let expected = layout.fixed_len() as usize;
    let newer = version.minor() > layout.version().minor();
    let older = version.minor() < layout.version().minor();
    let size_ok = fixed_len == expected || (newer && fixed_len > expected) || (older && fixed_len < expected);
    if !size_ok {
        return Err(SchemaError::mismatch(
            id,
            format!(
                "fixed section is {fixed_len} bytes, v{} expects {expected}",
                layout.version()
            ),
        ));
    }

    let fields = layout.fields();
    let present = fields.iter().take_while(|f| f.end() <= fixed_len).count();
    if let Some(cut) = fields.get(present) {
        if (cut.offset as usize) < fixed_len {
            return Err(SchemaError::mismatch(
                id,
                format!("fixed section ends inside field {:?}", cut.name),
            ));
        }
    }

    let mut heap_used = 0usize;
    for field in &fields[..present] {
        let slot = &fixed[field.offset as usize..field.end()];
        match field.ty {
            FieldType::Bool if slot[0] > 1 => {
                return Err(SchemaError::mismatch(
                    id,
                    format!("field {:?} holds {:#04x}, not a bool", field.name, slot[0]),
                ));
            }
            FieldType::String | FieldType::Bytes => {
                let (start, len) = heap_ref(slot);
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= heap.len())
                    .ok_or_else(|| {
                        SchemaError::mismatch(
                            id,
                            format!("field {:?} points outside the heap", field.name),
                        )
                    })?;
                if field.ty == FieldType::String && core::str::from_utf8(&heap[start..end]).is_err() {
                    return Err(SchemaError::mismatch(
                        id,
                        format!("field {:?} is not valid UTF-8", field.name),
                    ));
                }
                heap_used = heap_used.max(end);
            }
            _ => {}
        }
    }

    if !newer && heap.len() != heap_used {
        return Err(SchemaError::mismatch(
            id,
            format!("{} heap bytes are not referenced by any field", heap.len() - heap_used),
        ));
    }

    Ok(DecodedMessage {
        layout,
        version,
        fixed,
        heap,
        present,
        heap_used,
    })
}

#[inline]
fn heap_ref(slot: &[u8]) -> (usize, usize) {
    let start = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    let len = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]) as usize;
    (start, len)
}

fn read_field<'a>(field: &FieldDef, fixed: &'a [u8], heap: &'a [u8]) -> Option<FieldRef<'a>> {
    let s = fixed.get(field.offset as usize..field.end())?;
    let value = match field.ty {
        FieldType::U8 => FieldRef::U8(s[0]),
        FieldType::Bool => FieldRef::Bool(s[0] != 0),
        FieldType::U16 => FieldRef::U16(u16::from_le_bytes([s[0], s[1]])),
        FieldType::U32 => FieldRef::U32(u32::from_le_bytes([s[0], s[1], s[2], s[3]])),
        FieldType::I32 => FieldRef::I32(i32::from_le_bytes([s[0], s[1], s[2], s[3]])),
        FieldType::U64 => FieldRef::U64(u64::from_le_bytes(word(s))),
        FieldType::I64 => FieldRef::I64(i64::from_le_bytes(word(s))),
        FieldType::F64 => FieldRef::F64(f64::from_le_bytes(word(s))),
        FieldType::FixedBytes(_) => FieldRef::Bytes(s),
        FieldType::Bytes => {
            let (start, len) = heap_ref(s);
            FieldRef::Bytes(heap.get(start..start + len)?)
        }
        FieldType::String => {
            let (start, len) = heap_ref(s);
            FieldRef::Str(core::str::from_utf8(heap.get(start..start + len)?).ok()?)
        }
    };
    Some(value)
}

#[inline]
fn word(s: &[u8]) -> [u8; 8] {
    [s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]
}
