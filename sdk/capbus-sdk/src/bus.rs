//! One kernel, one router, one schema registry

use std::sync::Arc;

use cap_broker::{CapabilityManager, Kernel};
use capbus_router::{Router, RouterConfig};
use capbus_schema::SchemaRegistry;

use crate::error::Result;
use crate::manifest::BusManifest;
use crate::process::Process;

/// A running bus
///
/// Owns the kernel every process is spawned into and the router serving
/// `bus.bootstrap`.
#[derive(Clone)]
pub struct Bus {
    kernel: Kernel,
    registry: Arc<SchemaRegistry>,
    router: Router,
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("router", &self.router)
            .field("schemas", &self.registry.schema_ids())
            .finish()
    }
}

impl Bus {
    pub fn new() -> Result<Self> {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Result<Self> {
        let kernel = Kernel::new();
        let registry = Arc::new(SchemaRegistry::new());
        let router = Router::start(&kernel, Arc::clone(&registry), config)?;
        Ok(Self {
            kernel,
            registry,
            router,
        })
    }

    /// Boot a bus with the manifest's timeouts, schemas and topics
    pub fn from_manifest(manifest: &BusManifest) -> Result<Self> {
        manifest.validate()?;
        let bus = Self::with_config(manifest.router_config())?;
        let installed = manifest.install(&bus.registry)?;
        for topic in &manifest.topics {
            bus.router.register_topic(&topic.name, topic.schema)?;
        }
        log::info!(
            "bus: manifest installed ({} schemas, {} topics)",
            installed.len(),
            manifest.topics.len()
        );
        Ok(bus)
    }

    /// Start a process with an empty capability table
    pub fn spawn_process(&self, name: &str) -> Process {
        let pid = self.kernel.spawn_process(name);
        Process::new(
            name,
            CapabilityManager::new(self.kernel.clone(), pid),
            self.router.clone(),
        )
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) {
        self.router.shutdown();
    }
}
