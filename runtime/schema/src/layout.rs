//! Field tables and payload layouts
//!
//! A layout fixes where each field lives in the fixed section of a payload.
//! Scalars sit inline at their offset; variable-length fields (`string`,
//! `bytes`) own an 8-byte slot holding `(heap_offset: u32, len: u32)` that
//! points into the heap following the fixed section.

use core::fmt;
use core::str::FromStr;

use crate::error::{Result, SchemaError};

/// Size of the slot a variable-length field occupies in the fixed section
pub const VAR_SLOT_SIZE: u16 = 8;

/// Size of the payload prefix carrying the fixed section length
pub const FIXED_LEN_PREFIX: usize = 2;

/// Longest field name the binary descriptor can carry
pub const MAX_FIELD_NAME: usize = u8::MAX as usize;

/// Schema version: major in the high byte, minor in the low byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u16);

impl Version {
    #[inline]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | minor as u16)
    }

    #[inline]
    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub const fn minor(self) -> u8 {
        self.0 as u8
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

impl FromStr for Version {
    type Err = SchemaError;

    /// Parses `"M.m"` (or a bare `"M"`, meaning minor 0)
    fn from_str(s: &str) -> Result<Self> {
        let bad = || SchemaError::InvalidLayout(format!("bad version string {s:?}"));
        let (major, minor) = match s.split_once('.') {
            Some((ma, mi)) => (ma, mi),
            None => (s, "0"),
        };
        let major = major.trim().parse::<u8>().map_err(|_| bad())?;
        let minor = minor.trim().parse::<u8>().map_err(|_| bad())?;
        Ok(Self::new(major, minor))
    }
}

/// Type of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F64,
    Bool,
    /// Fixed-length byte array stored inline
    FixedBytes(u16),
    /// UTF-8 text stored in the heap
    String,
    /// Raw bytes stored in the heap
    Bytes,
}

impl FieldType {
    /// Bytes the field occupies in the fixed section
    pub const fn slot_size(self) -> u16 {
        match self {
            FieldType::U8 | FieldType::Bool => 1,
            FieldType::U16 => 2,
            FieldType::U32 | FieldType::I32 => 4,
            FieldType::U64 | FieldType::I64 | FieldType::F64 => 8,
            FieldType::FixedBytes(n) => n,
            FieldType::String | FieldType::Bytes => VAR_SLOT_SIZE,
        }
    }

    #[inline]
    pub const fn is_variable(self) -> bool {
        matches!(self, FieldType::String | FieldType::Bytes)
    }

    /// Tag used in the binary descriptor
    pub const fn tag(self) -> u8 {
        match self {
            FieldType::U8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 3,
            FieldType::U64 => 4,
            FieldType::I32 => 5,
            FieldType::I64 => 6,
            FieldType::F64 => 7,
            FieldType::Bool => 8,
            FieldType::FixedBytes(_) => 9,
            FieldType::String => 10,
            FieldType::Bytes => 11,
        }
    }

    /// Inverse of [`FieldType::tag`]; `length` is only used by `bytes[N]`
    pub fn from_tag(tag: u8, length: u16) -> Result<Self> {
        let ty = match tag {
            1 => FieldType::U8,
            2 => FieldType::U16,
            3 => FieldType::U32,
            4 => FieldType::U64,
            5 => FieldType::I32,
            6 => FieldType::I64,
            7 => FieldType::F64,
            8 => FieldType::Bool,
            9 => FieldType::FixedBytes(length),
            10 => FieldType::String,
            11 => FieldType::Bytes,
            other => {
                return Err(SchemaError::InvalidLayout(format!(
                    "unknown field type tag {other}"
                )))
            }
        };
        if ty.slot_size() != length {
            return Err(SchemaError::InvalidLayout(format!(
                "field of type {ty} declares length {length}, expected {}",
                ty.slot_size()
            )));
        }
        Ok(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::U8 => f.write_str("u8"),
            FieldType::U16 => f.write_str("u16"),
            FieldType::U32 => f.write_str("u32"),
            FieldType::U64 => f.write_str("u64"),
            FieldType::I32 => f.write_str("i32"),
            FieldType::I64 => f.write_str("i64"),
            FieldType::F64 => f.write_str("f64"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::FixedBytes(n) => write!(f, "bytes[{n}]"),
            FieldType::String => f.write_str("string"),
            FieldType::Bytes => f.write_str("bytes"),
        }
    }
}

impl FromStr for FieldType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let ty = match s {
            "u8" => FieldType::U8,
            "u16" => FieldType::U16,
            "u32" => FieldType::U32,
            "u64" => FieldType::U64,
            "i32" => FieldType::I32,
            "i64" => FieldType::I64,
            "f64" => FieldType::F64,
            "bool" => FieldType::Bool,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            _ => {
                let n = s
                    .strip_prefix("bytes[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .and_then(|n| n.parse::<u16>().ok())
                    .ok_or_else(|| SchemaError::InvalidLayout(format!("unknown field type {s:?}")))?;
                FieldType::FixedBytes(n)
            }
        };
        Ok(ty)
    }
}

/// One entry of a field table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// Offset within the fixed section
    pub offset: u16,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType, offset: u16) -> Self {
        Self {
            name: name.into(),
            ty,
            offset,
        }
    }

    /// First byte past the field's slot
    #[inline]
    pub fn end(&self) -> usize {
        self.offset as usize + self.ty.slot_size() as usize
    }
}

/// A validated field table for one schema version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    schema_id: u32,
    version: Version,
    fields: Vec<FieldDef>,
    fixed_len: u16,
}

impl Layout {
    /// Check a field table and build a layout from it
    ///
    /// Fields must be declared in offset order, must not overlap, and must
    /// have unique non-empty names.
    pub fn new(schema_id: u32, version: Version, fields: Vec<FieldDef>) -> Result<Self> {
        let mut end = 0usize;
        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty() || field.name.len() > MAX_FIELD_NAME {
                return Err(SchemaError::InvalidLayout(format!(
                    "field #{i} has an invalid name length ({})",
                    field.name.len()
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::InvalidLayout(format!(
                    "duplicate field name {:?}",
                    field.name
                )));
            }
            if field.ty.slot_size() == 0 {
                return Err(SchemaError::InvalidLayout(format!(
                    "field {:?} has zero size",
                    field.name
                )));
            }
            if (field.offset as usize) < end {
                return Err(SchemaError::InvalidLayout(format!(
                    "field {:?} at offset {} overlaps the previous field (ends at {end})",
                    field.name, field.offset
                )));
            }
            end = field.end();
        }

        let fixed_len = u16::try_from(end).map_err(|_| {
            SchemaError::InvalidLayout(format!("fixed section of {end} bytes is too large"))
        })?;

        Ok(Self {
            schema_id,
            version,
            fields,
            fixed_len,
        })
    }

    /// Start a layout whose fields are packed back to back
    pub fn builder(schema_id: u32, version: Version) -> LayoutBuilder {
        LayoutBuilder {
            schema_id,
            version,
            fields: Vec::new(),
            next_offset: 0,
        }
    }

    #[inline]
    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    #[inline]
    pub fn fixed_len(&self) -> u16 {
        self.fixed_len
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    /// True when `self` is `newer` with fields removed from the tail
    pub fn is_prefix_of(&self, newer: &Layout) -> bool {
        newer.fields.len() >= self.fields.len()
            && newer.fields[..self.fields.len()] == self.fields[..]
            && newer.fields[self.fields.len()..]
                .iter()
                .all(|f| f.offset >= self.fixed_len)
    }
}

/// Packs fields sequentially
pub struct LayoutBuilder {
    schema_id: u32,
    version: Version,
    fields: Vec<FieldDef>,
    next_offset: usize,
}

impl LayoutBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        // Offsets past u16 are caught by Layout::new
        let offset = u16::try_from(self.next_offset).unwrap_or(u16::MAX);
        self.next_offset += ty.slot_size() as usize;
        self.fields.push(FieldDef::new(name, ty, offset));
        self
    }

    pub fn build(self) -> Result<Layout> {
        if self.next_offset > u16::MAX as usize {
            return Err(SchemaError::InvalidLayout(format!(
                "fixed section of {} bytes is too large",
                self.next_offset
            )));
        }
        Layout::new(self.schema_id, self.version, self.fields)
    }
}
