//! capbus SDK
//!
//! Process-level API over the bus router.
//!
//! # Modules
//! - [`bus`]: one kernel, router and schema registry
//! - [`process`]: processes, service handlers and topic subscriptions
//! - [`manifest`]: TOML declarations of schemas, services and topics
//! - [`error`]: SDK error types
//!
//! # Example
//! ```no_run
//! use capbus_sdk::{Bus, FieldType, Layout, Record, SchemaPair, Version};
//!
//! # fn main() -> capbus_sdk::Result<()> {
//! let bus = Bus::new()?;
//! bus.registry().register_layout(
//!     Layout::builder(0xEC40, Version::new(1, 0)).field("text", FieldType::String).build()?,
//! )?;
//!
//! let server = bus.spawn_process("echo-server");
//! let _echo = server.serve("echo", SchemaPair::symmetric(0xEC40), |request| {
//!     request.record().clone()
//! })?;
//! server.run()?;
//!
//! let client = bus.spawn_process("client");
//! let reply = client.call("echo", &Record::new().with("text", "hi"))?;
//! assert_eq!(reply.str("text"), Some("hi"));
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod error;
pub mod manifest;
pub mod process;

pub use bus::Bus;
pub use error::{Result, SdkError};
pub use manifest::{BusManifest, BusSection, FieldDecl, SchemaDecl, ServiceDecl, TopicDecl};
pub use process::{Process, ServiceHandle, SubscriptionHandle};

pub use cap_broker::{Capability, CapabilityManager, Kernel, ProcessId, Rights};
pub use capbus_ipc::Channel;
pub use capbus_router::{
    BusError, ErrorKind, Event, IncomingRequest, PublishReport, Router, RouterConfig, SchemaPair,
    Subscription,
};
pub use capbus_schema::{FieldType, Layout, Record, SchemaRegistry, Value, Version};

/// SDK version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
