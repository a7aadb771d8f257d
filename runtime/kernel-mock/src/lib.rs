//! Host-simulated microkernel for capbus development
//!
//! # Purpose
//! The bus consumes a microkernel whose only primitives are capabilities and
//! synchronous IPC. This crate provides exactly those primitives on a
//! development host so the bus can be built, run and tested without a real
//! kernel underneath.
//!
//! # Integration Points
//! - Depends on: nothing but the host OS (threads)
//! - Provides to: Capability Manager (`cap-broker`), Channel (`capbus-ipc`)
//! - IPC endpoints: zero-capacity rendezvous objects
//! - Capabilities required: n/a (this *is* the capability authority)
//!
//! # Architecture
//! - Object table: endpoints and memory regions, each owned by a process
//! - Capability derivation tree: every capability, its holder and lineage
//! - Endpoint rendezvous with bounded waits and destruction wake-ups
//!
//! Every invocation is checked here: holder, liveness and rights. A
//! userspace capability handle confers nothing the tree does not confirm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub mod abi;
mod cdt;
mod endpoint;
mod error;
mod object;
mod process;
mod rights;

pub use abi::{IpcFrame, MessageRegisters, INLINE_PAYLOAD_BYTES, MAX_CAPS, MSG_REGS};
pub use cdt::{CapInfo, CapNodeId};
pub use error::{KernelError, Result};
pub use object::{ObjectId, ObjectKind, ObjectRef};
pub use process::ProcessId;
pub use rights::Rights;

use cdt::DerivationTree;
use endpoint::{Endpoint, RendezvousError};
use object::ObjectEntry;
use process::ProcessRecord;

/// A frame delivered to a receiver, with the capabilities it carried
#[derive(Debug)]
pub struct Delivery {
    pub frame: IpcFrame,
    /// Attached capabilities, already moved to the receiving process
    pub caps: Vec<CapInfo>,
}

struct KernelState {
    objects: RwLock<HashMap<ObjectId, ObjectEntry>>,
    cdt: Mutex<DerivationTree>,
    processes: Mutex<HashMap<ProcessId, ProcessRecord>>,
    next_object: AtomicU64,
    next_pid: AtomicU64,
}

/// Handle to the kernel; cheap to clone, shared by every process
#[derive(Clone)]
pub struct Kernel {
    state: Arc<KernelState>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(KernelState {
                objects: RwLock::new(HashMap::new()),
                cdt: Mutex::new(DerivationTree::new()),
                processes: Mutex::new(HashMap::new()),
                next_object: AtomicU64::new(1),
                next_pid: AtomicU64::new(1),
            }),
        }
    }

    fn cdt(&self) -> MutexGuard<'_, DerivationTree> {
        self.state.cdt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<ProcessId, ProcessRecord>> {
        self.state
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Processes
    // ---------------------------------------------------------------------

    /// Register a new process
    pub fn spawn_process(&self, name: &str) -> ProcessId {
        let pid = ProcessId(self.state.next_pid.fetch_add(1, Ordering::Relaxed));
        self.processes().insert(
            pid,
            ProcessRecord {
                name: name.to_string(),
                alive: true,
            },
        );
        log::debug!("kernel: spawned {} ({})", pid, name);
        pid
    }

    pub fn process_alive(&self, pid: ProcessId) -> bool {
        self.processes().get(&pid).is_some_and(|p| p.alive)
    }

    pub fn process_name(&self, pid: ProcessId) -> Option<String> {
        self.processes().get(&pid).map(|p| p.name.clone())
    }

    fn require_alive(&self, pid: ProcessId) -> Result<()> {
        if self.process_alive(pid) {
            Ok(())
        } else {
            Err(KernelError::InvalidProcess(pid))
        }
    }

    /// Tear a process down: destroy what it owns, revoke what it holds
    pub fn exit_process(&self, pid: ProcessId) -> Result<()> {
        {
            let mut processes = self.processes();
            let record = processes
                .get_mut(&pid)
                .ok_or(KernelError::InvalidProcess(pid))?;
            if !record.alive {
                return Err(KernelError::InvalidProcess(pid));
            }
            record.alive = false;
        }

        let owned: Vec<ObjectId> = self
            .state
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| entry.owner == pid)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            // Already gone is fine: another thread may have revoked it
            let _ = self.destroy_object(*id);
        }

        let revoked = self.cdt().revoke_held_by(pid);
        log::info!(
            "kernel: {} exited, destroyed {} objects, revoked {} held capabilities",
            pid,
            owned.len(),
            revoked
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Create a kernel object owned by `owner`
    pub fn create_object(&self, owner: ProcessId, kind: ObjectKind) -> Result<ObjectRef> {
        self.require_alive(owner)?;
        let id = ObjectId(self.state.next_object.fetch_add(1, Ordering::Relaxed));
        self.state
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ObjectEntry::new(kind, owner));
        log::debug!("kernel: {} created {} ({:?})", owner, id, kind);
        Ok(ObjectRef { id, kind })
    }

    /// Destroy an object, waking its waiters and revoking every capability to it
    pub fn destroy_object(&self, id: ObjectId) -> Result<()> {
        let entry = self
            .state
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(KernelError::InvalidObject(id))?;

        if let Some(ep) = &entry.endpoint {
            ep.close();
        }
        let revoked = self.cdt().revoke_object(id);
        log::debug!("kernel: destroyed {}, revoked {} capabilities", id, revoked);
        Ok(())
    }

    pub fn object_alive(&self, id: ObjectId) -> bool {
        self.state
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn object_owner(&self, id: ObjectId) -> Result<ProcessId> {
        self.state
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|e| e.owner)
            .ok_or(KernelError::InvalidObject(id))
    }

    fn endpoint(&self, id: ObjectId) -> Result<Arc<Endpoint>> {
        let objects = self
            .state
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = objects.get(&id).ok_or(KernelError::ObjectDestroyed(id))?;
        match (&entry.kind, &entry.endpoint) {
            (ObjectKind::Endpoint, Some(ep)) => Ok(Arc::clone(ep)),
            _ => Err(KernelError::NotAnEndpoint(id)),
        }
    }

    // ---------------------------------------------------------------------
    // Capabilities
    // ---------------------------------------------------------------------

    /// Mint an original capability; only the object's owner may do this
    pub fn cap_mint(
        &self,
        holder: ProcessId,
        object: ObjectRef,
        rights: Rights,
        badge: u64,
    ) -> Result<CapInfo> {
        let owner = self.object_owner(object.id)?;
        if owner != holder {
            return Err(KernelError::NotOwner {
                object: object.id,
                holder,
            });
        }
        Ok(self.cdt().insert_root(object, rights, badge, holder))
    }

    /// Derive a child capability held by the same process
    pub fn cap_derive(
        &self,
        holder: ProcessId,
        parent: CapNodeId,
        rights: Rights,
        badge: u64,
    ) -> Result<CapInfo> {
        let mut cdt = self.cdt();
        cdt.check(holder, parent, Rights::empty())?;
        cdt.derive(parent, rights, badge, holder)
    }

    /// Move a held capability to another live process
    pub fn cap_move(&self, from: ProcessId, node: CapNodeId, to: ProcessId) -> Result<CapInfo> {
        self.require_alive(to)?;
        let mut cdt = self.cdt();
        cdt.check(from, node, Rights::GRANT)?;
        cdt.move_to(node, to)
    }

    /// Revoke a capability and its subtree; requires `REVOKE`
    pub fn cap_revoke(&self, holder: ProcessId, node: CapNodeId) -> Result<usize> {
        let info = self.cdt().check(holder, node, Rights::REVOKE)?;
        Ok(self.invalidate(info))
    }

    /// Give up a held capability (and its subtree) without needing `REVOKE`
    pub fn cap_release(&self, holder: ProcessId, node: CapNodeId) -> Result<usize> {
        let info = self.cdt().check(holder, node, Rights::empty())?;
        Ok(self.invalidate(info))
    }

    fn invalidate(&self, info: CapInfo) -> usize {
        // The owner dropping an original capability takes the object with it
        let owner_root =
            info.is_root() && self.object_owner(info.object.id).ok() == Some(info.holder);
        if owner_root {
            let before = self.cdt().live_count();
            if self.destroy_object(info.object.id).is_ok() {
                return before.saturating_sub(self.cdt().live_count());
            }
        }
        self.cdt().revoke(info.node).len()
    }

    /// Current kernel view of a capability
    pub fn cap_status(&self, node: CapNodeId) -> Result<CapInfo> {
        self.cdt().status(node)
    }

    /// Verify `holder` holds a live `node` with at least `required`
    pub fn cap_check(&self, holder: ProcessId, node: CapNodeId, required: Rights) -> Result<CapInfo> {
        self.cdt().check(holder, node, required)
    }

    // ---------------------------------------------------------------------
    // IPC
    // ---------------------------------------------------------------------

    /// Synchronous send through `node`
    ///
    /// Blocks until a receiver accepts the frame, the timeout expires
    /// (`Timeout`), the endpoint is destroyed (`ObjectDestroyed`) or `node`
    /// is revoked (`CapabilityRevoked`). A frame the receiver refuses because
    /// `node` or an attachment died during the hand-off is reported the same
    /// way, never as delivered. Attaching capabilities requires `GRANT` on
    /// `node`, and every attached capability must be held by the sender.
    pub fn endpoint_send(
        &self,
        holder: ProcessId,
        node: CapNodeId,
        mut frame: IpcFrame,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut required = Rights::SEND;
        if frame.cap_count() > 0 {
            required |= Rights::GRANT;
        }

        let (info, revoked) = {
            let cdt = self.cdt();
            let info = cdt.check(holder, node, required)?;
            for attached in frame.caps() {
                cdt.check(holder, attached, Rights::empty())?;
            }
            (info, cdt.revocation_signal(node)?)
        };
        if !info.object.is_endpoint() {
            return Err(KernelError::NotAnEndpoint(info.object.id));
        }

        let ep = self.endpoint(info.object.id)?;
        frame.stamp(info.badge, node);
        let attached: Vec<CapNodeId> = frame.caps().collect();

        let accepted = ep.send(frame, timeout, &revoked).map_err(|e| match e {
            RendezvousError::Timeout => KernelError::Timeout,
            RendezvousError::Closed => KernelError::ObjectDestroyed(info.object.id),
            RendezvousError::Revoked => KernelError::CapabilityRevoked(node),
        })?;
        if accepted {
            return Ok(());
        }

        // Refused: name whichever capability died
        let cdt = self.cdt();
        let dead = core::iter::once(node)
            .chain(attached)
            .find(|c| !cdt.is_live(*c))
            .unwrap_or(node);
        Err(KernelError::CapabilityRevoked(dead))
    }

    /// Synchronous receive through `node`
    ///
    /// Frames whose sending capability, or any attached capability, was
    /// revoked before delivery are refused (the sender is told) and the wait
    /// continues. Revoking `node` itself ends the wait with
    /// `CapabilityRevoked`.
    pub fn endpoint_recv(
        &self,
        holder: ProcessId,
        node: CapNodeId,
        timeout: Option<Duration>,
    ) -> Result<Delivery> {
        let (info, revoked) = {
            let cdt = self.cdt();
            (cdt.check(holder, node, Rights::RECEIVE)?, cdt.revocation_signal(node)?)
        };
        if !info.object.is_endpoint() {
            return Err(KernelError::NotAnEndpoint(info.object.id));
        }
        let ep = self.endpoint(info.object.id)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(KernelError::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };

            let handoff = ep.recv(remaining, &revoked).map_err(|e| match e {
                RendezvousError::Timeout => KernelError::Timeout,
                RendezvousError::Closed => KernelError::ObjectDestroyed(info.object.id),
                RendezvousError::Revoked => KernelError::CapabilityRevoked(node),
            })?;

            // Checks and the capability move happen under one lock, so a
            // revocation lands either before acceptance or after delivery
            let mut cdt = self.cdt();
            if !cdt.is_live(node) {
                handoff.acknowledge(false);
                return Err(KernelError::CapabilityRevoked(node));
            }
            let sender_live = handoff.frame.sender().is_some_and(|s| cdt.is_live(s));
            let caps_live = handoff.frame.caps().all(|c| cdt.is_live(c));
            if !sender_live || !caps_live {
                log::warn!(
                    "kernel: refused stale frame on {} (sender revoked: {}, attachment revoked: {})",
                    info.object.id,
                    !sender_live,
                    !caps_live
                );
                handoff.acknowledge(false);
                continue;
            }

            let attached: Vec<CapNodeId> = handoff.frame.caps().collect();
            let mut caps = Vec::with_capacity(attached.len());
            for attached in attached {
                match cdt.move_to(attached, holder) {
                    Ok(moved) => caps.push(moved),
                    Err(e) => {
                        handoff.acknowledge(false);
                        return Err(e);
                    }
                }
            }
            let frame = handoff.acknowledge(true);
            return Ok(Delivery { frame, caps });
        }
    }
}
