//! Capability Manager - per-process capability table for capbus
//!
//! # Purpose
//! Every process on the bus holds its authority as capabilities. The
//! manager is the process-side view of that authority: it creates kernel
//! objects, mints and delegates capabilities, revokes them, hands them to
//! other processes and answers "which capability did this message come
//! through?" for incoming badges.
//!
//! # Integration Points
//! - Depends on: `kernel-mock` (objects, derivation tree, rights checks)
//! - Provides to: Channel (`capbus-ipc`), Router, SDK
//! - IPC endpoints: none of its own
//! - Capabilities required: whatever the owning process holds
//!
//! # Architecture
//! The table is a small CSpace: slots allocated from a free list, each
//! holding a [`Capability`] handle. Handles are plain data; the kernel is
//! consulted on every operation, so a handle to a revoked capability fails
//! with [`CapabilityError::CapabilityRevoked`] no matter who presents it.
//!
//! Badges are issued from a per-process counter starting at 1, so a badge
//! is unique across every endpoint of the issuing process and 0 always
//! means "unbadged".
//!
//! # Testing Strategy
//! - Unit tests: slot allocation, badge issue, rights attenuation
//! - Integration tests: delegation chains, revocation across processes

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

mod cspace;

pub use kernel_mock::{
    CapInfo, CapNodeId, Kernel, KernelError, ObjectId, ObjectKind, ObjectRef, ProcessId, Rights,
};

use cspace::CSpace;

/// Capability slot index within a process table
pub type CSlot = usize;

/// Kernel-stamped identifier of the capability a message was sent through
pub type Badge = u64;

/// Default number of slots in a process table
pub const DEFAULT_CSPACE_SLOTS: CSlot = 4096;

/// Error types for capability operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("object {0} does not exist")]
    InvalidObject(ObjectId),

    #[error("requested rights {requested:?} exceed held rights {held:?}")]
    RightsExceeded { requested: Rights, held: Rights },

    #[error("capability {0} has been revoked")]
    CapabilityRevoked(CapNodeId),

    #[error("no capability carries badge {0:#x}")]
    UnknownBadge(Badge),

    #[error("slot {slot} does not hold this capability")]
    NotHeld { slot: CSlot },

    #[error("process {holder} does not own object {object}")]
    NotOwner { object: ObjectId, holder: ProcessId },

    #[error("out of capability slots")]
    OutOfSlots,

    #[error("kernel error: {0}")]
    Kernel(KernelError),
}

impl From<KernelError> for CapabilityError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::InvalidObject(id) | KernelError::ObjectDestroyed(id) => {
                CapabilityError::InvalidObject(id)
            }
            KernelError::CapabilityRevoked(node) => CapabilityError::CapabilityRevoked(node),
            KernelError::InsufficientRights { required, held } => {
                CapabilityError::RightsExceeded {
                    requested: required,
                    held,
                }
            }
            KernelError::NotOwner { object, holder } => CapabilityError::NotOwner { object, holder },
            other => CapabilityError::Kernel(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, CapabilityError>;

/// Handle to one capability in a process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    slot: CSlot,
    node: CapNodeId,
    object: ObjectRef,
    rights: Rights,
    badge: Badge,
}

impl Capability {
    fn from_info(slot: CSlot, info: CapInfo) -> Self {
        Self {
            slot,
            node: info.node,
            object: info.object,
            rights: info.rights,
            badge: info.badge,
        }
    }

    /// Slot in the holding table
    ///
    /// For a capability returned by [`CapabilityManager::lookup`] that was
    /// delegated out of this table, this is the slot of the capability it
    /// was derived from.
    #[inline]
    pub fn slot(&self) -> CSlot {
        self.slot
    }

    #[inline]
    pub fn node(&self) -> CapNodeId {
        self.node
    }

    #[inline]
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    #[inline]
    pub fn rights(&self) -> Rights {
        self.rights
    }

    #[inline]
    pub fn badge(&self) -> Badge {
        self.badge
    }

    #[inline]
    pub fn has_rights(&self, rights: Rights) -> bool {
        self.rights.contains(rights)
    }
}

/// Capability table of one process
///
/// Cloning yields another handle to the same table, so the receive loops
/// and request handlers of a process can share it.
#[derive(Clone)]
pub struct CapabilityManager {
    kernel: Kernel,
    pid: ProcessId,
    cspace: Arc<Mutex<CSpace>>,
}

impl CapabilityManager {
    pub fn new(kernel: Kernel, pid: ProcessId) -> Self {
        Self::with_slots(kernel, pid, DEFAULT_CSPACE_SLOTS)
    }

    pub fn with_slots(kernel: Kernel, pid: ProcessId, max_slots: CSlot) -> Self {
        Self {
            kernel,
            pid,
            cspace: Arc::new(Mutex::new(CSpace::new(max_slots))),
        }
    }

    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn cspace(&self) -> MutexGuard<'_, CSpace> {
        self.cspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an endpoint owned by this process and mint a full-rights root
    pub fn create_endpoint(&self) -> Result<Capability> {
        let object = self.kernel.create_object(self.pid, ObjectKind::Endpoint)?;
        self.mint(object, Rights::ENDPOINT_OWNER)
    }

    /// Create a memory region owned by this process
    pub fn create_memory_region(&self, size: usize) -> Result<Capability> {
        let object = self
            .kernel
            .create_object(self.pid, ObjectKind::MemoryRegion { size })?;
        self.mint(object, Rights::all())
    }

    /// Mint an original capability to an object this process owns
    ///
    /// # Errors
    /// `InvalidObject` when the object is gone, `NotOwner` when another
    /// process owns it, `OutOfSlots` when the table is full.
    pub fn mint(&self, object: ObjectRef, rights: Rights) -> Result<Capability> {
        let mut cspace = self.cspace();
        let slot = cspace.allocate_slot()?;
        let badge = cspace.next_badge();

        let info = match self.kernel.cap_mint(self.pid, object, rights, badge) {
            Ok(info) => info,
            Err(e) => {
                cspace.free_slot(slot);
                return Err(e.into());
            }
        };

        let cap = Capability::from_info(slot, info);
        cspace.insert(cap);
        cspace.record_issue(cap, slot);
        log::debug!(
            "{}: minted {} on {} rights={:?} badge={:#x} slot={}",
            self.pid,
            cap.node,
            object.id,
            rights,
            badge,
            slot
        );
        Ok(cap)
    }

    /// Derive a capability with reduced rights and a fresh badge
    ///
    /// The new capability is a child of `cap` in the derivation tree, so
    /// revoking `cap` revokes it as well.
    ///
    /// # Errors
    /// `RightsExceeded` when `rights` is not a subset of the held rights.
    pub fn delegate(&self, cap: &Capability, rights: Rights) -> Result<Capability> {
        let mut cspace = self.cspace();
        let held = cspace.resolve(cap)?;
        if !held.rights.contains(rights) {
            return Err(CapabilityError::RightsExceeded {
                requested: rights,
                held: held.rights,
            });
        }

        let slot = cspace.allocate_slot()?;
        let badge = cspace.next_badge();
        let info = match self.kernel.cap_derive(self.pid, held.node, rights, badge) {
            Ok(info) => info,
            Err(e) => {
                cspace.free_slot(slot);
                return Err(e.into());
            }
        };

        let derived = Capability::from_info(slot, info);
        cspace.insert(derived);
        cspace.record_issue(derived, held.slot);
        log::debug!(
            "{}: delegated {} from {} rights={:?} badge={:#x}",
            self.pid,
            derived.node,
            held.node,
            rights,
            badge
        );
        Ok(derived)
    }

    /// Revoke a capability and everything derived from it, in any process
    ///
    /// Revoking the owner's original capability destroys the object. The
    /// revoked handles stay in their tables and fail with
    /// `CapabilityRevoked` until released.
    ///
    /// # Errors
    /// `RightsExceeded` when `cap` lacks `REVOKE`.
    pub fn revoke(&self, cap: &Capability) -> Result<usize> {
        let held = self.cspace().resolve(cap)?;
        let revoked = self.kernel.cap_revoke(self.pid, held.node)?;
        log::info!(
            "{}: revoked {} on {} ({} capabilities invalidated)",
            self.pid,
            held.node,
            held.object.id,
            revoked
        );
        Ok(revoked)
    }

    /// Drop a capability from this table
    ///
    /// Anything derived from it is invalidated too. Releasing a handle that
    /// was already revoked only frees the slot.
    pub fn release(&self, cap: &Capability) -> Result<()> {
        let mut cspace = self.cspace();
        let held = cspace.resolve(cap)?;
        match self.kernel.cap_release(self.pid, held.node) {
            Ok(_) | Err(KernelError::CapabilityRevoked(_)) => {}
            Err(e) => return Err(e.into()),
        }
        cspace.remove(held.slot);
        log::debug!("{}: released {} (slot {})", self.pid, held.node, held.slot);
        Ok(())
    }

    /// Move a capability into another process's table
    ///
    /// The capability leaves this table; the returned handle lives in `to`.
    ///
    /// # Errors
    /// `RightsExceeded` when `cap` lacks `GRANT`.
    pub fn transfer(&self, cap: &Capability, to: &CapabilityManager) -> Result<Capability> {
        let held = self.cspace().resolve(cap)?;
        let info = self.kernel.cap_move(self.pid, held.node, to.pid)?;
        self.cspace().remove(held.slot);

        let moved = to.install(info)?;
        log::debug!(
            "{}: transferred {} to {} (slot {})",
            self.pid,
            held.node,
            to.pid,
            moved.slot
        );
        Ok(moved)
    }

    /// Take ownership of a capability the kernel moved to this process
    ///
    /// Used for capabilities that arrived attached to a message.
    pub fn adopt(&self, info: CapInfo) -> Result<Capability> {
        let info = self.kernel.cap_check(self.pid, info.node, Rights::empty())?;
        self.install(info)
    }

    fn install(&self, info: CapInfo) -> Result<Capability> {
        let mut cspace = self.cspace();
        let slot = cspace.allocate_slot()?;
        let cap = Capability::from_info(slot, info);
        cspace.insert(cap);
        Ok(cap)
    }

    /// Remove a handle whose kernel capability already left this process
    pub fn forget(&self, cap: &Capability) -> bool {
        let mut cspace = self.cspace();
        match cspace.resolve(cap) {
            Ok(held) => cspace.remove(held.slot).is_some(),
            Err(_) => false,
        }
    }

    /// Resolve the capability an incoming message's badge refers to
    ///
    /// Badges are those this process issued by minting or delegating,
    /// including capabilities since handed to other processes.
    ///
    /// # Errors
    /// `UnknownBadge` for badges this process never issued,
    /// `CapabilityRevoked` when the badged capability is no longer live.
    pub fn lookup(&self, badge: Badge) -> Result<Capability> {
        let cspace = self.cspace();
        let issued = cspace
            .issued(badge)
            .ok_or(CapabilityError::UnknownBadge(badge))?;
        let info = self.kernel.cap_status(issued.cap.node)?;
        let slot = cspace.slot_of(info.node).unwrap_or(issued.anchor);
        Ok(Capability::from_info(slot, info))
    }

    /// Confirm a handle is held here and still live
    pub fn validate(&self, cap: &Capability) -> Result<Capability> {
        self.check(cap, Rights::empty())
    }

    /// Confirm a handle is held here, live, and carries `required`
    pub fn check(&self, cap: &Capability, required: Rights) -> Result<Capability> {
        let held = self.cspace().resolve(cap)?;
        let info = self.kernel.cap_check(self.pid, held.node, required)?;
        Ok(Capability::from_info(held.slot, info))
    }

    pub fn get(&self, slot: CSlot) -> Option<Capability> {
        self.cspace().get(slot)
    }

    /// Every handle currently in the table, revoked ones included
    pub fn held(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.cspace().held().copied().collect();
        caps.sort_by_key(|c| c.slot);
        caps
    }

    /// Release every revoked handle, returning how many slots were freed
    pub fn sweep(&self) -> usize {
        let mut cspace = self.cspace();
        let dead: Vec<CSlot> = cspace
            .held()
            .filter(|c| self.kernel.cap_status(c.node).is_err())
            .map(|c| c.slot)
            .collect();
        for slot in &dead {
            cspace.remove(*slot);
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.cspace().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for CapabilityManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CapabilityManager")
            .field("pid", &self.pid)
            .field("slots", &self.len())
            .finish()
    }
}
