//! Capability Derivation Tree (CDT)
//!
//! Tracks parent-child relationships between capabilities so revocation can
//! reach every descendant, wherever it has been transferred.
//!
//! ## Design
//!
//! Following seL4's approach:
//! - Minted capabilities are roots (no parent)
//! - Derived capabilities are children of the capability they came from
//! - Revoking a node revokes its whole subtree
//!
//! Nodes are addressed by id instead of pointer. Revoked nodes stay in the
//! table as tombstones so later use reports `CapabilityRevoked` rather than
//! an unknown capability.

use core::fmt;
use std::collections::HashMap;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::{KernelError, Result};
use crate::object::{ObjectId, ObjectRef};
use crate::process::ProcessId;
use crate::rights::Rights;

/// Kernel identity of one capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapNodeId(pub(crate) u64);

impl CapNodeId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CapNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap:{}", self.0)
    }
}

/// Snapshot of a capability as the kernel sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapInfo {
    pub node: CapNodeId,
    pub object: ObjectRef,
    pub rights: Rights,
    pub badge: u64,
    pub holder: ProcessId,
    pub parent: Option<CapNodeId>,
}

impl CapInfo {
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

struct CapNode {
    info: CapInfo,
    children: Vec<CapNodeId>,
    live: bool,
    /// Dropped on revocation, disconnecting every `on_revoke` clone
    revoke_tx: Option<Sender<()>>,
    on_revoke: Receiver<()>,
}

impl CapNode {
    fn new(info: CapInfo) -> Self {
        let (revoke_tx, on_revoke) = bounded(0);
        Self {
            info,
            children: Vec::new(),
            live: true,
            revoke_tx: Some(revoke_tx),
            on_revoke,
        }
    }
}

#[derive(Default)]
pub(crate) struct DerivationTree {
    nodes: HashMap<CapNodeId, CapNode>,
    next_id: u64,
}

impl DerivationTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> CapNodeId {
        self.next_id += 1;
        CapNodeId(self.next_id)
    }

    /// Insert an original capability (no parent)
    pub fn insert_root(
        &mut self,
        object: ObjectRef,
        rights: Rights,
        badge: u64,
        holder: ProcessId,
    ) -> CapInfo {
        let node = self.alloc_id();
        let info = CapInfo {
            node,
            object,
            rights,
            badge,
            holder,
            parent: None,
        };
        self.nodes.insert(node, CapNode::new(info));
        info
    }

    /// Derive a child with a subset of the parent's rights
    pub fn derive(
        &mut self,
        parent: CapNodeId,
        rights: Rights,
        badge: u64,
        holder: ProcessId,
    ) -> Result<CapInfo> {
        let parent_info = self.status(parent)?;
        if !parent_info.rights.contains(rights) {
            return Err(KernelError::InsufficientRights {
                required: rights,
                held: parent_info.rights,
            });
        }

        let node = self.alloc_id();
        let info = CapInfo {
            node,
            object: parent_info.object,
            rights,
            badge,
            holder,
            parent: Some(parent),
        };
        self.nodes.insert(node, CapNode::new(info));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(node);
        }
        Ok(info)
    }

    /// Current state of a node; revoked nodes fail with `CapabilityRevoked`
    pub fn status(&self, node: CapNodeId) -> Result<CapInfo> {
        match self.nodes.get(&node) {
            None => Err(KernelError::InvalidCapability(node)),
            Some(n) if !n.live => Err(KernelError::CapabilityRevoked(node)),
            Some(n) => Ok(n.info),
        }
    }

    pub fn is_live(&self, node: CapNodeId) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.live)
    }

    /// A receiver that disconnects once `node` is revoked
    ///
    /// Lets a thread blocked on behalf of a capability wake when it dies.
    pub fn revocation_signal(&self, node: CapNodeId) -> Result<Receiver<()>> {
        self.status(node)?;
        self.nodes
            .get(&node)
            .map(|n| n.on_revoke.clone())
            .ok_or(KernelError::InvalidCapability(node))
    }

    /// Check that `holder` holds a live `node` carrying at least `required`
    pub fn check(&self, holder: ProcessId, node: CapNodeId, required: Rights) -> Result<CapInfo> {
        let info = self.status(node)?;
        if info.holder != holder {
            return Err(KernelError::NotHolder { node, holder });
        }
        if !info.rights.contains(required) {
            return Err(KernelError::InsufficientRights {
                required,
                held: info.rights,
            });
        }
        Ok(info)
    }

    /// Move a live node to a new holder
    pub fn move_to(&mut self, node: CapNodeId, holder: ProcessId) -> Result<CapInfo> {
        self.status(node)?;
        let n = self
            .nodes
            .get_mut(&node)
            .ok_or(KernelError::InvalidCapability(node))?;
        n.info.holder = holder;
        Ok(n.info)
    }

    /// Revoke a node and its whole subtree, returning every node revoked
    pub fn revoke(&mut self, node: CapNodeId) -> Vec<CapNodeId> {
        let mut revoked = Vec::new();
        let mut stack = vec![node];

        while let Some(current) = stack.pop() {
            let Some(n) = self.nodes.get_mut(&current) else {
                continue;
            };
            if n.live {
                n.live = false;
                n.revoke_tx = None;
                revoked.push(current);
            }
            stack.extend(n.children.iter().copied());
        }

        revoked
    }

    /// Revoke every capability referring to `object`
    pub fn revoke_object(&mut self, object: ObjectId) -> usize {
        let roots: Vec<CapNodeId> = self
            .nodes
            .values()
            .filter(|n| n.live && n.info.object.id == object)
            .map(|n| n.info.node)
            .collect();
        roots.into_iter().map(|r| self.revoke(r).len()).sum()
    }

    /// Revoke every capability held by `holder`, with descendants
    pub fn revoke_held_by(&mut self, holder: ProcessId) -> usize {
        let held: Vec<CapNodeId> = self
            .nodes
            .values()
            .filter(|n| n.live && n.info.holder == holder)
            .map(|n| n.info.node)
            .collect();
        held.into_iter().map(|h| self.revoke(h).len()).sum()
    }

    /// Number of live nodes (for diagnostics)
    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| n.live).count()
    }
}
