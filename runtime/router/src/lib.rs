//! capbus Bus Router
//!
//! The router binds service names and topics to endpoint capabilities and
//! moves messages between processes that never share anything but the
//! capabilities they were granted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Services / Subscribers / SDK       │
//! └──────────────┬──────────────────────────┘
//!                │ call / publish / bus.bootstrap
//! ┌──────────────▼──────────────────────────┐
//! │        Bus Router (this crate)          │
//! │  • Service Registry                     │
//! │  • Topic Registry                       │
//! │  • Bootstrap service                    │
//! └──────────────┬──────────────────────────┘
//!                │ Channels (schema-bound)
//! ┌──────────────▼──────────────────────────┐
//! │   Capability Manager + kernel IPC       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Services**: unique names, request/response calls with per-call reply
//!   endpoints and deadlines
//! - **Topics**: fan-out publish with independent, ordered delivery
//! - **Bootstrap**: registration as a single call to `bus.bootstrap`
//! - **Crash handling**: bindings whose capabilities were revoked are pruned
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cap_broker::{CapabilityManager, Kernel};
//! use capbus_ipc::Channel;
//! use capbus_router::{Router, RouterConfig, SchemaPair};
//! use capbus_schema::{FieldType, Layout, Record, SchemaRegistry, Version};
//!
//! let kernel = Kernel::new();
//! let registry = Arc::new(SchemaRegistry::new());
//! registry.register_layout(
//!     Layout::builder(0xEC40, Version::new(1, 0)).field("text", FieldType::String).build()?,
//! )?;
//! let router = Router::start(&kernel, Arc::clone(&registry), RouterConfig::default())?;
//!
//! let server = CapabilityManager::new(kernel.clone(), kernel.spawn_process("echo"));
//! let inbox = Channel::open(&server, server.create_endpoint()?, 0xEC40)?;
//! let echo = router.register_service(&server, "echo", SchemaPair::symmetric(0xEC40), inbox)?;
//!
//! std::thread::spawn(move || {
//!     while let Ok(request) = echo.next_request(None) {
//!         let reply = request.record().clone();
//!         let _ = request.respond(&reply);
//!     }
//! });
//!
//! let client = CapabilityManager::new(kernel.clone(), kernel.spawn_process("client"));
//! let reply = router.call(&client, "echo", &Record::new().with("text", "hi"))?;
//! assert_eq!(reply.str("text"), Some("hi"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bootstrap;
pub mod config;
pub mod endpoint;
pub mod error;
mod router;
pub mod service_registry;
pub mod topic_registry;

pub use bootstrap::{BootstrapOp, BOOTSTRAP_SERVICE};
pub use config::RouterConfig;
pub use endpoint::{Event, IncomingRequest, ServiceEndpoint, TopicEndpoint};
pub use error::{BusError, ErrorKind, Result};
pub use router::{DeliveryFailure, PublishReport, Router, ROUTER_PROCESS_NAME};
pub use service_registry::{SchemaPair, ServiceInfo, MAX_NAME_LEN};
pub use topic_registry::{Subscription, SubscriptionId, TopicInfo};
