//! Per-process capability space
//!
//! Slot allocation reuses freed slots first, then bumps towards the slot
//! limit. Alongside the slots the table remembers every badge this process
//! issued, so incoming messages can be traced back to the capability they
//! were sent through even after that capability was handed to someone else.

use std::collections::HashMap;

use kernel_mock::CapNodeId;

use crate::{Badge, CSlot, Capability, CapabilityError, Result};

/// Slot allocator
pub(crate) struct CSpaceAllocator {
    /// Next never-used slot
    next_slot: CSlot,
    /// Exclusive upper bound
    max_slots: CSlot,
    /// Freed slots, reused LIFO
    free_slots: Vec<CSlot>,
}

impl CSpaceAllocator {
    pub fn new(initial_slot: CSlot, max_slots: CSlot) -> Self {
        Self {
            next_slot: initial_slot,
            max_slots,
            free_slots: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<CSlot> {
        if let Some(slot) = self.free_slots.pop() {
            return Ok(slot);
        }

        if self.next_slot >= self.max_slots {
            return Err(CapabilityError::OutOfSlots);
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(slot)
    }

    pub fn free(&mut self, slot: CSlot) {
        self.free_slots.push(slot);
    }
}

/// A badge issued by this process
#[derive(Debug, Clone, Copy)]
pub(crate) struct Issued {
    pub cap: Capability,
    /// Slot of the capability it came from (its own slot for minted caps)
    pub anchor: CSlot,
}

pub(crate) struct CSpace {
    allocator: CSpaceAllocator,
    slots: HashMap<CSlot, Capability>,
    by_node: HashMap<CapNodeId, CSlot>,
    issued: HashMap<Badge, Issued>,
    next_badge: Badge,
}

impl CSpace {
    pub fn new(max_slots: CSlot) -> Self {
        Self {
            // Slot 0 stays null, as in seL4
            allocator: CSpaceAllocator::new(1, max_slots),
            slots: HashMap::new(),
            by_node: HashMap::new(),
            issued: HashMap::new(),
            next_badge: 1,
        }
    }

    pub fn allocate_slot(&mut self) -> Result<CSlot> {
        self.allocator.allocate()
    }

    pub fn free_slot(&mut self, slot: CSlot) {
        self.allocator.free(slot);
    }

    pub fn next_badge(&mut self) -> Badge {
        let badge = self.next_badge;
        self.next_badge += 1;
        badge
    }

    pub fn insert(&mut self, cap: Capability) {
        self.by_node.insert(cap.node(), cap.slot());
        self.slots.insert(cap.slot(), cap);
    }

    pub fn record_issue(&mut self, cap: Capability, anchor: CSlot) {
        self.issued.insert(cap.badge(), Issued { cap, anchor });
    }

    /// Remove a slot, returning what it held
    pub fn remove(&mut self, slot: CSlot) -> Option<Capability> {
        let cap = self.slots.remove(&slot)?;
        // A message sent to ourselves can leave the node in two slots briefly
        if self.by_node.get(&cap.node()) == Some(&slot) {
            self.by_node.remove(&cap.node());
        }
        self.allocator.free(slot);
        Some(cap)
    }

    /// Resolve a handle against the table; the slot must hold that very node
    pub fn resolve(&self, cap: &Capability) -> Result<Capability> {
        match self.slots.get(&cap.slot()) {
            Some(held) if held.node() == cap.node() => Ok(*held),
            _ => Err(CapabilityError::NotHeld { slot: cap.slot() }),
        }
    }

    pub fn get(&self, slot: CSlot) -> Option<Capability> {
        self.slots.get(&slot).copied()
    }

    pub fn slot_of(&self, node: CapNodeId) -> Option<CSlot> {
        self.by_node.get(&node).copied()
    }

    pub fn issued(&self, badge: Badge) -> Option<Issued> {
        self.issued.get(&badge).copied()
    }

    pub fn held(&self) -> impl Iterator<Item = &Capability> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
