//! Bus manifests
//!
//! A manifest declares, in TOML, the schemas a deployment uses, the
//! services and topics it expects, and the router's timeouts:
//!
//! ```toml
//! [bus]
//! publish_timeout_ms = 250
//!
//! [[schema]]
//! id = 0xEC40
//! version = "1.0"
//! fields = [{ name = "text", type = "string" }]
//!
//! [[service]]
//! name = "echo"
//! request = 0xEC40
//! response = 0xEC40
//!
//! [[topic]]
//! name = "temps"
//! schema = 0x7E30
//! ```
//!
//! Every section is optional; an empty file is a valid manifest.

use core::str::FromStr;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use capbus_router::{RouterConfig, SchemaPair};
use capbus_schema::{FieldDef, FieldType, Layout, SchemaRegistry, Version};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusManifest {
    #[serde(default)]
    pub bus: BusSection,

    #[serde(default, rename = "schema")]
    pub schemas: Vec<SchemaDecl>,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDecl>,

    #[serde(default, rename = "topic")]
    pub topics: Vec<TopicDecl>,
}

/// Router timing, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_publish_timeout_ms() -> u64 {
    millis(RouterConfig::default().publish_timeout)
}

fn default_reply_timeout_ms() -> u64 {
    millis(RouterConfig::default().reply_timeout)
}

fn default_call_timeout_ms() -> u64 {
    millis(RouterConfig::default().default_call_timeout)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDecl {
    pub id: u32,

    /// `"M.m"`
    pub version: String,

    /// Human-readable label, not part of the wire format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,

    /// `u8` … `f64`, `bool`, `string`, `bytes`, `bytes[N]`
    #[serde(rename = "type")]
    pub ty: String,

    /// Placed right after the previous field when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u16>,

    /// Length of a fixed `bytes` field; same as writing `bytes[N]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
}

impl FieldDecl {
    fn field_type(&self) -> Result<FieldType> {
        match (FieldType::from_str(&self.ty)?, self.length) {
            (ty, None) => Ok(ty),
            (FieldType::Bytes, Some(n)) => Ok(FieldType::FixedBytes(n)),
            (FieldType::FixedBytes(n), Some(m)) if n == m => Ok(FieldType::FixedBytes(n)),
            (ty, Some(n)) => Err(SdkError::Manifest(format!(
                "field {:?}: length {} does not apply to type {}",
                self.name, n, ty
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDecl {
    pub name: String,
    pub request: u32,
    pub response: u32,
}

impl ServiceDecl {
    pub fn schemas(&self) -> SchemaPair {
        SchemaPair::new(self.request, self.response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDecl {
    pub name: String,
    pub schema: u32,
}

impl FromStr for BusManifest {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        let manifest: BusManifest = toml::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

impl BusManifest {
    /// Read and validate a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SdkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = contents.parse()?;
        log::debug!("manifest: loaded {}", path.display());
        Ok(manifest)
    }

    /// Cross-check declarations against each other
    ///
    /// Every schema must build into a valid layout, and every service or
    /// topic must reference a schema declared here.
    pub fn validate(&self) -> Result<()> {
        let layouts = self.layouts()?;
        let declared: HashSet<u32> = layouts.iter().map(Layout::schema_id).collect();

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(SdkError::Manifest(format!("service {:?} declared twice", service.name)));
            }
            for id in [service.request, service.response] {
                if !declared.contains(&id) {
                    return Err(SdkError::Manifest(format!(
                        "service {:?} uses undeclared schema {:#010x}",
                        service.name, id
                    )));
                }
            }
        }

        let mut topics = HashSet::new();
        for topic in &self.topics {
            if !topics.insert(topic.name.as_str()) {
                return Err(SdkError::Manifest(format!("topic {:?} declared twice", topic.name)));
            }
            if !declared.contains(&topic.schema) {
                return Err(SdkError::Manifest(format!(
                    "topic {:?} uses undeclared schema {:#010x}",
                    topic.name, topic.schema
                )));
            }
        }
        Ok(())
    }

    /// Build every declared schema
    pub fn layouts(&self) -> Result<Vec<Layout>> {
        self.schemas.iter().map(build_layout).collect()
    }

    /// Register every declared schema, oldest version first
    pub fn install(&self, registry: &SchemaRegistry) -> Result<Vec<Arc<Layout>>> {
        let mut layouts = self.layouts()?;
        layouts.sort_by_key(|l| (l.schema_id(), l.version()));
        layouts
            .into_iter()
            .map(|layout| registry.register_layout(layout).map_err(SdkError::from))
            .collect()
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            publish_timeout: Duration::from_millis(self.bus.publish_timeout_ms),
            reply_timeout: Duration::from_millis(self.bus.reply_timeout_ms),
            default_call_timeout: Duration::from_millis(self.bus.call_timeout_ms),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDecl> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn build_layout(decl: &SchemaDecl) -> Result<Layout> {
    let version = Version::from_str(&decl.version)?;
    let mut fields = Vec::with_capacity(decl.fields.len());
    let mut next = 0usize;
    for field in &decl.fields {
        let ty = field.field_type()?;
        let offset = match field.offset {
            Some(offset) => offset,
            None => u16::try_from(next).map_err(|_| {
                SdkError::Manifest(format!("schema {:#010x}: fixed section too large", decl.id))
            })?,
        };
        let def = FieldDef::new(field.name.clone(), ty, offset);
        next = def.end();
        fields.push(def);
    }
    Ok(Layout::new(decl.id, version, fields)?)
}
