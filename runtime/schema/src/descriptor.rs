//! Schema binary descriptor
//!
//! ## Format
//!
//! ```text
//! schema_id: u32 | version: u16 | field_count: u16
//! field_count x { offset: u16 | type tag: u8 | length: u16 | name_len: u8 | name }
//! ```
//!
//! Little-endian throughout. [`DescriptorView`] checks a descriptor once and
//! then iterates it in place.

use crate::error::{Result, SchemaError};
use crate::layout::{FieldDef, FieldType, Layout, Version};

const HEADER_LEN: usize = 8;
const ENTRY_FIXED_LEN: usize = 6;

/// Serialize a layout as a binary descriptor
pub fn encode_descriptor(layout: &Layout) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_LEN
            + layout
                .fields()
                .iter()
                .map(|f| ENTRY_FIXED_LEN + f.name.len())
                .sum::<usize>(),
    );
    out.extend_from_slice(&layout.schema_id().to_le_bytes());
    out.extend_from_slice(&layout.version().raw().to_le_bytes());
    // Layout::new bounds field count and name length
    out.extend_from_slice(&(layout.fields().len() as u16).to_le_bytes());
    for field in layout.fields() {
        out.extend_from_slice(&field.offset.to_le_bytes());
        out.push(field.ty.tag());
        out.extend_from_slice(&field.ty.slot_size().to_le_bytes());
        out.push(field.name.len() as u8);
        out.extend_from_slice(field.name.as_bytes());
    }
    out
}

/// One field entry, borrowed from the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldEntry<'a> {
    pub offset: u16,
    pub ty: FieldType,
    pub name: &'a str,
}

/// A checked, borrowed descriptor
#[derive(Debug, Clone, Copy)]
pub struct DescriptorView<'a> {
    bytes: &'a [u8],
}

impl<'a> DescriptorView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(truncated(bytes.len()));
        }
        let view = Self { bytes };
        let mut pos = HEADER_LEN;
        for _ in 0..view.field_count() {
            let (_, next) = read_entry(bytes, pos)?;
            pos = next;
        }
        if pos != bytes.len() {
            return Err(SchemaError::InvalidLayout(format!(
                "{} trailing bytes after the last field entry",
                bytes.len() - pos
            )));
        }
        Ok(view)
    }

    pub fn schema_id(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn version(&self) -> Version {
        Version(u16::from_le_bytes([self.bytes[4], self.bytes[5]]))
    }

    pub fn field_count(&self) -> usize {
        u16::from_le_bytes([self.bytes[6], self.bytes[7]]) as usize
    }

    pub fn fields(&self) -> DescriptorFields<'a> {
        DescriptorFields {
            bytes: self.bytes,
            pos: HEADER_LEN,
            remaining: self.field_count(),
        }
    }

    /// Build an owned layout (checks offsets and names)
    pub fn to_layout(&self) -> Result<Layout> {
        let fields = self
            .fields()
            .map(|f| FieldDef::new(f.name, f.ty, f.offset))
            .collect();
        Layout::new(self.schema_id(), self.version(), fields)
    }
}

/// Iterator over the entries of a [`DescriptorView`]
pub struct DescriptorFields<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for DescriptorFields<'a> {
    type Item = FieldEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        // Entries were checked by DescriptorView::parse
        let (entry, next) = read_entry(self.bytes, self.pos).ok()?;
        self.pos = next;
        self.remaining -= 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

fn truncated(len: usize) -> SchemaError {
    SchemaError::InvalidLayout(format!("descriptor truncated at {len} bytes"))
}

fn read_entry(bytes: &[u8], pos: usize) -> Result<(FieldEntry<'_>, usize)> {
    let head = bytes
        .get(pos..pos + ENTRY_FIXED_LEN)
        .ok_or_else(|| truncated(bytes.len()))?;
    let offset = u16::from_le_bytes([head[0], head[1]]);
    let tag = head[2];
    let length = u16::from_le_bytes([head[3], head[4]]);
    let name_len = head[5] as usize;

    let name_start = pos + ENTRY_FIXED_LEN;
    let name = bytes
        .get(name_start..name_start + name_len)
        .ok_or_else(|| truncated(bytes.len()))?;
    let name = core::str::from_utf8(name)
        .map_err(|_| SchemaError::InvalidLayout("field name is not valid UTF-8".into()))?;

    let ty = FieldType::from_tag(tag, length)?;
    Ok((FieldEntry { offset, ty, name }, name_start + name_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::builder(0xB005_0001, Version::new(1, 0))
            .field("op", FieldType::U8)
            .field("name", FieldType::String)
            .field("key", FieldType::FixedBytes(4))
            .build()
            .unwrap()
    }

    #[test]
    fn descriptor_bytes() {
        let bytes = encode_descriptor(&layout());
        assert_eq!(&bytes[..8], &[0x01, 0x00, 0x05, 0xB0, 0x00, 0x01, 3, 0]);
        // op: offset 0, tag 1, length 1, "op"
        assert_eq!(&bytes[8..16], &[0, 0, 1, 1, 0, 2, b'o', b'p']);
    }

    #[test]
    fn view_walks_entries() {
        let bytes = encode_descriptor(&layout());
        let view = DescriptorView::parse(&bytes).unwrap();
        assert_eq!(view.schema_id(), 0xB005_0001);
        assert_eq!(view.version(), Version::new(1, 0));

        let entries: Vec<FieldEntry<'_>> = view.fields().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, "name");
        assert_eq!(entries[1].ty, FieldType::String);
        assert_eq!(entries[1].offset, 1);
        assert_eq!(entries[2].ty, FieldType::FixedBytes(4));

        assert_eq!(view.to_layout().unwrap(), layout());
    }

    #[test]
    fn truncated_descriptor_rejected() {
        let bytes = encode_descriptor(&layout());
        for cut in [0, 7, 9, bytes.len() - 1] {
            assert!(DescriptorView::parse(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn length_must_match_type() {
        let mut bytes = encode_descriptor(&layout());
        // op declared as 2 bytes wide
        bytes[11] = 2;
        assert!(matches!(
            DescriptorView::parse(&bytes),
            Err(SchemaError::InvalidLayout(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_descriptor(&layout());
        bytes.push(0);
        assert!(DescriptorView::parse(&bytes).is_err());
    }
}
