//! Schema Registry - typed message definitions for capbus
//!
//! # Purpose
//! Every message on the bus is a schema-tagged payload. This crate holds
//! the field tables, applies the versioning rule and validates payloads on
//! the delivery path before they reach application code.
//!
//! # Integration Points
//! - Depends on: nothing but `thiserror`/`log`
//! - Provides to: Router (request/response/topic validation), SDK, CLI
//! - IPC endpoints: none (pure data)
//! - Capabilities required: none
//!
//! # Architecture
//! - [`layout`]: field types, field tables, versions
//! - [`codec`]: payload encoding and allocation-free validation
//! - [`registry`]: versioned schema table and compatibility rule
//! - [`descriptor`]: compact binary schema descriptors
//!
//! # Example
//!
//! ```
//! use capbus_schema::{FieldType, Layout, Record, SchemaRegistry, Version};
//!
//! let registry = SchemaRegistry::new();
//! let v1 = Version::new(1, 0);
//! registry
//!     .register_layout(Layout::builder(0xEC40, v1).field("text", FieldType::String).build()?)?;
//!
//! let bytes = registry.encode(0xEC40, v1, &Record::new().with("text", "hi"))?;
//! let msg = registry.validate(0xEC40, v1, &bytes)?;
//! assert_eq!(msg.str("text"), Some("hi"));
//! # Ok::<(), capbus_schema::SchemaError>(())
//! ```

pub mod codec;
pub mod descriptor;
mod error;
pub mod layout;
pub mod registry;
mod value;

pub use codec::{DecodedMessage, FieldRef};
pub use descriptor::{encode_descriptor, DescriptorView, FieldEntry};
pub use error::{Result, SchemaError};
pub use layout::{FieldDef, FieldType, Layout, LayoutBuilder, Version};
pub use registry::SchemaRegistry;
pub use value::{Record, Value};
