//! Service Registry
//!
//! Manages service registration and discovery. The router never holds a
//! service's endpoint, only a `SEND | GRANT` capability derived from it, so
//! a binding whose capability was revoked (owner exited, endpoint revoked)
//! is treated as deregistered and pruned on the next lookup.

use std::collections::HashMap;

use cap_broker::ProcessId;
use capbus_ipc::Channel;

use crate::error::{BusError, Result};

/// Maximum service or topic name length
pub const MAX_NAME_LEN: usize = 64;

/// Request and response schema of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaPair {
    pub request: u32,
    pub response: u32,
}

impl SchemaPair {
    pub const fn new(request: u32, response: u32) -> Self {
        Self { request, response }
    }

    /// Same schema both ways
    pub const fn symmetric(schema: u32) -> Self {
        Self::new(schema, schema)
    }
}

/// Public view of a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub schemas: SchemaPair,
    pub owner: ProcessId,
}

/// A registered service
#[derive(Debug, Clone)]
pub(crate) struct ServiceRecord {
    pub name: String,
    pub schemas: SchemaPair,
    /// Router-side outbound channel to the service endpoint
    pub channel: Channel,
    /// Process that registered this service
    pub owner: ProcessId,
}

impl ServiceRecord {
    fn is_live(&self) -> bool {
        let caps = self.channel.capabilities();
        let cap_live = self
            .channel
            .outbound()
            .is_some_and(|cap| caps.validate(cap).is_ok());
        cap_live && caps.kernel().process_alive(self.owner)
    }

    /// Same binding: same owner reached through the same router capability
    fn same_binding(&self, other: &ServiceRecord) -> bool {
        let node = |r: &ServiceRecord| r.channel.outbound().map(|cap| cap.node());
        self.owner == other.owner && node(self) == node(other)
    }

    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name.clone(),
            schemas: self.schemas,
            owner: self.owner,
        }
    }

    fn discard(self) {
        log::info!("router: pruned service {:?} (owner {} gone)", self.name, self.owner);
        // The router's copy is already revoked; only the slot is left to free
        let _ = self.channel.close();
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let printable = name.chars().all(|c| !c.is_control() && !c.is_whitespace());
    if name.is_empty() || name.len() > MAX_NAME_LEN || !printable {
        return Err(BusError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Service Registry
pub(crate) struct ServiceRegistry {
    services: HashMap<String, ServiceRecord>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Drop the binding for `name` if its capability no longer works
    fn prune(&mut self, name: &str) {
        if self.services.get(name).is_some_and(|s| !s.is_live()) {
            if let Some(dead) = self.services.remove(name) {
                dead.discard();
            }
        }
    }

    /// Fail with `NameTaken` while a live service holds `name`
    pub fn check_available(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.prune(name);
        if self.services.contains_key(name) {
            return Err(BusError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    /// Bind a service; callers check availability under the same lock
    pub fn insert(&mut self, record: ServiceRecord) {
        log::info!(
            "router: service {:?} registered by {} (request {:#010x}, response {:#010x})",
            record.name,
            record.owner,
            record.schemas.request,
            record.schemas.response
        );
        self.services.insert(record.name.clone(), record);
    }

    /// Lookup a live service by name
    pub fn lookup(&mut self, name: &str) -> Result<ServiceRecord> {
        self.prune(name);
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::ServiceNotFound(name.to_string()))
    }

    /// Unregister a service on behalf of its owner
    pub fn unregister(&mut self, name: &str, owner: ProcessId) -> Result<ServiceRecord> {
        self.prune(name);
        match self.services.get(name) {
            None => Err(BusError::ServiceNotFound(name.to_string())),
            Some(record) if record.owner != owner => Err(BusError::NotOwner {
                name: name.to_string(),
            }),
            Some(_) => self
                .services
                .remove(name)
                .ok_or_else(|| BusError::ServiceNotFound(name.to_string())),
        }
    }

    /// Drop `stale` after its peer was found unavailable
    ///
    /// A binding registered under the same name since `stale` was looked up
    /// is left alone.
    pub fn evict(&mut self, stale: &ServiceRecord) {
        if !self
            .services
            .get(&stale.name)
            .is_some_and(|current| current.same_binding(stale))
        {
            return;
        }
        if let Some(record) = self.services.remove(&stale.name) {
            record.discard();
        }
    }

    /// List live services, sorted by name
    pub fn list(&mut self) -> Vec<ServiceInfo> {
        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in &names {
            self.prune(name);
        }
        let mut infos: Vec<ServiceInfo> = self.services.values().map(ServiceRecord::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[cfg(test)]
    pub fn num_services(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_broker::{CapabilityManager, Kernel, Rights};

    fn record(kernel: &Kernel, router: &CapabilityManager, name: &str) -> ServiceRecord {
        let owner = CapabilityManager::new(kernel.clone(), kernel.spawn_process(name));
        let root = owner.create_endpoint().unwrap();
        let send = owner.delegate(&root, Rights::SEND | Rights::GRANT).unwrap();
        let held = owner.transfer(&send, router).unwrap();
        ServiceRecord {
            name: name.to_string(),
            schemas: SchemaPair::symmetric(1),
            channel: Channel::open(router, held, 1).unwrap(),
            owner: owner.pid(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let kernel = Kernel::new();
        let router = CapabilityManager::new(kernel.clone(), kernel.spawn_process("router"));
        let mut registry = ServiceRegistry::new();

        registry.check_available("echo").unwrap();
        registry.insert(record(&kernel, &router, "echo"));
        assert_eq!(registry.num_services(), 1);

        let found = registry.lookup("echo").unwrap();
        assert_eq!(found.schemas, SchemaPair::symmetric(1));
        assert!(matches!(
            registry.check_available("echo"),
            Err(BusError::NameTaken(_))
        ));
        assert!(matches!(
            registry.lookup("nope"),
            Err(BusError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_dead_owner_is_pruned() {
        let kernel = Kernel::new();
        let router = CapabilityManager::new(kernel.clone(), kernel.spawn_process("router"));
        let mut registry = ServiceRegistry::new();

        let rec = record(&kernel, &router, "echo");
        let owner = rec.owner;
        registry.insert(rec);
        kernel.exit_process(owner).unwrap();

        assert!(matches!(
            registry.lookup("echo"),
            Err(BusError::ServiceNotFound(_))
        ));
        assert_eq!(registry.num_services(), 0);
        // Name is free again
        registry.check_available("echo").unwrap();
    }

    #[test]
    fn test_unregister_owner_only() {
        let kernel = Kernel::new();
        let router = CapabilityManager::new(kernel.clone(), kernel.spawn_process("router"));
        let mut registry = ServiceRegistry::new();
        let rec = record(&kernel, &router, "echo");
        let owner = rec.owner;
        registry.insert(rec);

        assert!(matches!(
            registry.unregister("echo", router.pid()),
            Err(BusError::NotOwner { .. })
        ));
        registry.unregister("echo", owner).unwrap();
        assert_eq!(registry.num_services(), 0);
    }

    #[test]
    fn test_evict_spares_replacement() {
        let kernel = Kernel::new();
        let router = CapabilityManager::new(kernel.clone(), kernel.spawn_process("router"));
        let mut registry = ServiceRegistry::new();

        let first = record(&kernel, &router, "svc");
        registry.insert(first.clone());
        kernel.exit_process(first.owner).unwrap();

        registry.check_available("svc").unwrap();
        let mut second = record(&kernel, &router, "other");
        second.name = "svc".to_string();
        let second_owner = second.owner;
        registry.insert(second);

        registry.evict(&first);
        assert_eq!(registry.lookup("svc").unwrap().owner, second_owner);

        let current = registry.lookup("svc").unwrap();
        registry.evict(&current);
        assert_eq!(registry.num_services(), 0);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("bus.bootstrap").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
