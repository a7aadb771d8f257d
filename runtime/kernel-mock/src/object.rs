//! Kernel objects
//!
//! Objects are created on behalf of a process, which becomes their owner.
//! Other processes only ever reach an object through a capability.

use core::fmt;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::process::ProcessId;

/// Kernel object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Types of kernel objects reachable through capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Synchronous IPC rendezvous point
    Endpoint,

    /// Region of memory (only referenced by the bus, never mapped by it)
    MemoryRegion { size: usize },
}

/// Reference to a kernel object: identity plus type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub kind: ObjectKind,
}

impl ObjectRef {
    #[inline]
    pub fn is_endpoint(&self) -> bool {
        matches!(self.kind, ObjectKind::Endpoint)
    }
}

pub(crate) struct ObjectEntry {
    pub kind: ObjectKind,
    pub owner: ProcessId,
    pub endpoint: Option<Arc<Endpoint>>,
}

impl ObjectEntry {
    pub fn new(kind: ObjectKind, owner: ProcessId) -> Self {
        let endpoint = match kind {
            ObjectKind::Endpoint => Some(Arc::new(Endpoint::new())),
            ObjectKind::MemoryRegion { .. } => None,
        };
        Self {
            kind,
            owner,
            endpoint,
        }
    }
}
