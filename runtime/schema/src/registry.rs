//! Schema Registry
//!
//! Keeps every registered version of every schema and applies the
//! compatibility rule: minor versions within a major may only append
//! fields, majors never interoperate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::codec::{self, DecodedMessage};
use crate::descriptor::DescriptorView;
use crate::error::{Result, SchemaError};
use crate::layout::{FieldDef, Layout, Version};
use crate::value::Record;

type Versions = BTreeMap<Version, Arc<Layout>>;

/// Thread-safe table of schema layouts
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<u32, Versions>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `fields` as `version` of `schema_id`
    ///
    /// # Errors
    /// `InvalidLayout` for malformed tables, `DuplicateSchema` when the
    /// version is already bound to a different table or a new minor does not
    /// extend its neighbours.
    pub fn register(&self, schema_id: u32, fields: Vec<FieldDef>, version: Version) -> Result<Arc<Layout>> {
        self.register_layout(Layout::new(schema_id, version, fields)?)
    }

    pub fn register_layout(&self, layout: Layout) -> Result<Arc<Layout>> {
        let id = layout.schema_id();
        let version = layout.version();
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        let versions = schemas.entry(id).or_default();

        if let Some(existing) = versions.get(&version) {
            if **existing == layout {
                return Ok(Arc::clone(existing));
            }
            return Err(SchemaError::DuplicateSchema {
                id,
                version,
                reason: "version already registered with a different field table".into(),
            });
        }

        let same_major = |v: &Version| v.major() == version.major();
        let older = versions.range(..version).rev().map(|(_, l)| l).find(|l| same_major(&l.version()));
        let newer = versions.range(version..).map(|(_, l)| l).find(|l| same_major(&l.version()));

        if let Some(older) = older {
            if !older.is_prefix_of(&layout) {
                return Err(SchemaError::DuplicateSchema {
                    id,
                    version,
                    reason: format!("fields of v{} are not an unchanged prefix", older.version()),
                });
            }
        }
        if let Some(newer) = newer {
            if !layout.is_prefix_of(newer) {
                return Err(SchemaError::DuplicateSchema {
                    id,
                    version,
                    reason: format!("not a prefix of registered v{}", newer.version()),
                });
            }
        }

        let layout = Arc::new(layout);
        versions.insert(version, Arc::clone(&layout));
        log::debug!(
            "schema {:#010x} v{} registered ({} fields, {} fixed bytes)",
            id,
            version,
            layout.fields().len(),
            layout.fixed_len()
        );
        Ok(layout)
    }

    /// Install a schema from its binary descriptor
    pub fn register_descriptor(&self, bytes: &[u8]) -> Result<Arc<Layout>> {
        self.register_layout(DescriptorView::parse(bytes)?.to_layout()?)
    }

    /// The layout a payload written at `version` is interpreted with
    pub fn resolve(&self, schema_id: u32, version: Version) -> Result<Arc<Layout>> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        let versions = schemas
            .get(&schema_id)
            .filter(|v| !v.is_empty())
            .ok_or(SchemaError::UnknownSchema { id: schema_id })?;

        let mut candidates = versions
            .values()
            .filter(|l| l.version().major() == version.major());
        let oldest = candidates.next().ok_or_else(|| SchemaError::VersionIncompatible {
            id: schema_id,
            payload: version,
            reason: format!(
                "no major {} registered (have {})",
                version.major(),
                versions
                    .keys()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })?;

        let best = core::iter::once(oldest)
            .chain(candidates)
            .take_while(|l| l.version() <= version)
            .last()
            .unwrap_or(oldest);
        Ok(Arc::clone(best))
    }

    /// Exact registered version
    pub fn layout(&self, schema_id: u32, version: Version) -> Option<Arc<Layout>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema_id)?
            .get(&version)
            .cloned()
    }

    /// Newest registered version
    pub fn latest(&self, schema_id: u32) -> Option<Arc<Layout>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema_id)?
            .values()
            .next_back()
            .cloned()
    }

    pub fn contains(&self, schema_id: u32) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// Registered schema ids, ascending
    pub fn schema_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn versions(&self, schema_id: u32) -> Vec<Version> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema_id)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Check a payload without copying it
    pub fn validate<'a>(&self, schema_id: u32, version: Version, payload: &'a [u8]) -> Result<DecodedMessage<'a>> {
        let layout = self.resolve(schema_id, version)?;
        codec::validate(layout, version, payload)
    }

    /// Validate and copy a payload into a record
    pub fn decode(&self, schema_id: u32, version: Version, payload: &[u8]) -> Result<Record> {
        Ok(self.validate(schema_id, version, payload)?.to_record())
    }

    /// Encode a record with the exact registered `version`
    pub fn encode(&self, schema_id: u32, version: Version, value: &Record) -> Result<Vec<u8>> {
        let layout = match self.layout(schema_id, version) {
            Some(layout) => layout,
            None if self.contains(schema_id) => {
                return Err(SchemaError::VersionIncompatible {
                    id: schema_id,
                    payload: version,
                    reason: "version not registered".into(),
                })
            }
            None => return Err(SchemaError::UnknownSchema { id: schema_id }),
        };
        codec::encode(&layout, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FieldType;

    const ECHO: u32 = 0xEC40;

    fn echo_fields() -> Vec<FieldDef> {
        vec![FieldDef::new("text", FieldType::String, 0)]
    }

    #[test]
    fn register_is_idempotent() {
        let registry = SchemaRegistry::new();
        registry.register(ECHO, echo_fields(), Version::new(1, 0)).unwrap();
        registry.register(ECHO, echo_fields(), Version::new(1, 0)).unwrap();
        assert_eq!(registry.versions(ECHO), vec![Version::new(1, 0)]);
    }

    #[test]
    fn conflicting_table_is_duplicate() {
        let registry = SchemaRegistry::new();
        registry.register(ECHO, echo_fields(), Version::new(1, 0)).unwrap();
        let other = vec![FieldDef::new("text", FieldType::Bytes, 0)];
        assert!(matches!(
            registry.register(ECHO, other, Version::new(1, 0)),
            Err(SchemaError::DuplicateSchema { .. })
        ));
    }

    #[test]
    fn unknown_schema() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.validate(1, Version::new(1, 0), &[0, 0]),
            Err(SchemaError::UnknownSchema { id: 1 })
        ));
        assert!(matches!(
            registry.encode(1, Version::new(1, 0), &Record::new()),
            Err(SchemaError::UnknownSchema { id: 1 })
        ));
    }

    #[test]
    fn resolve_picks_highest_minor_not_newer() {
        let registry = SchemaRegistry::new();
        let v10 = echo_fields();
        let mut v12 = echo_fields();
        v12.push(FieldDef::new("n", FieldType::U32, 8));

        registry.register(ECHO, v10, Version::new(1, 0)).unwrap();
        registry.register(ECHO, v12, Version::new(1, 2)).unwrap();

        let pick = |v| registry.resolve(ECHO, v).unwrap().version();
        assert_eq!(pick(Version::new(1, 0)), Version::new(1, 0));
        assert_eq!(pick(Version::new(1, 1)), Version::new(1, 0));
        assert_eq!(pick(Version::new(1, 2)), Version::new(1, 2));
        assert_eq!(pick(Version::new(1, 9)), Version::new(1, 2));
        assert!(matches!(
            registry.resolve(ECHO, Version::new(2, 0)),
            Err(SchemaError::VersionIncompatible { .. })
        ));
    }

    #[test]
    fn payload_older_than_every_minor_uses_oldest() {
        let registry = SchemaRegistry::new();
        let mut v13 = echo_fields();
        v13.push(FieldDef::new("n", FieldType::U32, 8));
        registry.register(ECHO, v13, Version::new(1, 3)).unwrap();

        assert_eq!(
            registry.resolve(ECHO, Version::new(1, 1)).unwrap().version(),
            Version::new(1, 3)
        );
    }
}
