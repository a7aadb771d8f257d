//! Capability call ABI
//!
//! Messages cross the kernel as a fixed block of message registers plus an
//! optional indirect payload buffer and a small array of capability slots.
//!
//! ## Register Usage
//!
//! | reg | contents                                                        |
//! |-----|-----------------------------------------------------------------|
//! | r0  | label (user-defined; the bus uses it for call correlation)      |
//! | r1  | badge of the sending capability (written by the kernel)         |
//! | r2  | schema id [0..32) / version [32..48) / caps [48..56) / flags    |
//! | r3  | payload length in bytes                                         |
//! | r4+ | inline payload, little-endian, up to `INLINE_PAYLOAD_BYTES`     |
//!
//! Payloads longer than the inline area travel in the indirect buffer
//! (the IPC buffer of a real kernel) and set `FLAG_INDIRECT`.

use core::mem::size_of;
use static_assertions::const_assert_eq;

use crate::cdt::CapNodeId;
use crate::error::{KernelError, Result};

/// Number of message registers
pub const MSG_REGS: usize = 8;

/// Registers reserved for the header (label, badge, tag, length)
pub const HEADER_REGS: usize = 4;

/// Bytes of payload that fit in registers
pub const INLINE_PAYLOAD_BYTES: usize = (MSG_REGS - HEADER_REGS) * size_of::<u64>();

/// Maximum capabilities that can be transferred in one message
pub const MAX_CAPS: usize = 3;

/// Largest payload a frame can describe
pub const MAX_PAYLOAD_BYTES: usize = u32::MAX as usize;

/// Payload lives in the indirect buffer
pub const FLAG_INDIRECT: u8 = 0b0000_0001;

const REG_LABEL: usize = 0;
const REG_BADGE: usize = 1;
const REG_TAG: usize = 2;
const REG_LEN: usize = 3;

/// Fixed-width register block
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageRegisters(pub [u64; MSG_REGS]);

const_assert_eq!(size_of::<MessageRegisters>(), 64);
const_assert_eq!(INLINE_PAYLOAD_BYTES, 32);

/// Pack the r2 tag word
#[inline]
pub const fn pack_tag(schema_id: u32, version: u16, caps: u8, flags: u8) -> u64 {
    (schema_id as u64) | ((version as u64) << 32) | ((caps as u64) << 48) | ((flags as u64) << 56)
}

/// One message as the kernel transports it
#[derive(Debug, Clone)]
pub struct IpcFrame {
    regs: MessageRegisters,
    indirect: Option<Vec<u8>>,
    caps: [Option<CapNodeId>; MAX_CAPS],
    sender: Option<CapNodeId>,
}

impl IpcFrame {
    /// Marshal a message into registers
    ///
    /// # Errors
    /// `TooManyCaps` when more than `MAX_CAPS` capabilities are attached,
    /// `PayloadTooLarge` when the length does not fit the length register.
    pub fn build(
        label: u64,
        schema_id: u32,
        version: u16,
        payload: &[u8],
        caps: &[CapNodeId],
    ) -> Result<Self> {
        if caps.len() > MAX_CAPS {
            return Err(KernelError::TooManyCaps {
                count: caps.len(),
                max: MAX_CAPS,
            });
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(KernelError::PayloadTooLarge(payload.len()));
        }

        let mut regs = MessageRegisters::default();
        let mut flags = 0u8;
        let mut indirect = None;

        if payload.len() <= INLINE_PAYLOAD_BYTES {
            for (i, chunk) in payload.chunks(size_of::<u64>()).enumerate() {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                regs.0[HEADER_REGS + i] = u64::from_le_bytes(word);
            }
        } else {
            flags |= FLAG_INDIRECT;
            indirect = Some(payload.to_vec());
        }

        regs.0[REG_LABEL] = label;
        regs.0[REG_TAG] = pack_tag(schema_id, version, caps.len() as u8, flags);
        regs.0[REG_LEN] = payload.len() as u64;

        let mut slots = [None; MAX_CAPS];
        for (slot, cap) in slots.iter_mut().zip(caps) {
            *slot = Some(*cap);
        }

        Ok(Self {
            regs,
            indirect,
            caps: slots,
            sender: None,
        })
    }

    #[inline]
    pub fn registers(&self) -> &MessageRegisters {
        &self.regs
    }

    #[inline]
    pub fn label(&self) -> u64 {
        self.regs.0[REG_LABEL]
    }

    #[inline]
    pub fn badge(&self) -> u64 {
        self.regs.0[REG_BADGE]
    }

    #[inline]
    pub fn schema_id(&self) -> u32 {
        self.regs.0[REG_TAG] as u32
    }

    #[inline]
    pub fn version(&self) -> u16 {
        (self.regs.0[REG_TAG] >> 32) as u16
    }

    #[inline]
    pub fn cap_count(&self) -> usize {
        ((self.regs.0[REG_TAG] >> 48) as u8) as usize
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.regs.0[REG_TAG] >> 56) as u8
    }

    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.flags() & FLAG_INDIRECT != 0
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.regs.0[REG_LEN] as usize
    }

    /// Copy the payload out of the frame
    pub fn payload(&self) -> Vec<u8> {
        match &self.indirect {
            Some(buf) => buf.clone(),
            None => self.inline_payload(),
        }
    }

    /// Take the payload, avoiding a copy for indirect frames
    pub fn into_payload(self) -> Vec<u8> {
        match self.indirect {
            Some(buf) => buf,
            None => self.inline_payload(),
        }
    }

    fn inline_payload(&self) -> Vec<u8> {
        let len = self.payload_len().min(INLINE_PAYLOAD_BYTES);
        let mut out = Vec::with_capacity(len);
        for word in &self.regs.0[HEADER_REGS..] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    /// Capabilities attached to the frame
    pub fn caps(&self) -> impl Iterator<Item = CapNodeId> + '_ {
        self.caps.iter().take(self.cap_count()).flatten().copied()
    }

    /// Capability the frame was sent through (stamped by the kernel)
    #[inline]
    pub fn sender(&self) -> Option<CapNodeId> {
        self.sender
    }

    pub(crate) fn stamp(&mut self, badge: u64, sender: CapNodeId) {
        self.regs.0[REG_BADGE] = badge;
        self.sender = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_payload_fits_registers() {
        let payload = b"hello, bus";
        let frame = IpcFrame::build(7, 0xAB, 0x0102, payload, &[]).unwrap();

        assert!(!frame.is_indirect());
        assert_eq!(frame.label(), 7);
        assert_eq!(frame.schema_id(), 0xAB);
        assert_eq!(frame.version(), 0x0102);
        assert_eq!(frame.payload_len(), payload.len());
        assert_eq!(frame.payload(), payload.to_vec());
    }

    #[test]
    fn exactly_inline_capacity_stays_inline() {
        let payload = [0x5Au8; INLINE_PAYLOAD_BYTES];
        let frame = IpcFrame::build(0, 1, 1, &payload, &[]).unwrap();
        assert!(!frame.is_indirect());
        assert_eq!(frame.into_payload(), payload.to_vec());
    }

    #[test]
    fn large_payload_goes_indirect() {
        let payload: Vec<u8> = (0..200u8).collect();
        let frame = IpcFrame::build(0, 1, 1, &payload, &[]).unwrap();
        assert!(frame.is_indirect());
        assert_eq!(frame.payload(), payload);
    }

    #[test]
    fn cap_slots_are_bounded() {
        let caps = [CapNodeId(1), CapNodeId(2), CapNodeId(3), CapNodeId(4)];
        assert!(matches!(
            IpcFrame::build(0, 1, 1, &[], &caps),
            Err(KernelError::TooManyCaps { count: 4, max: MAX_CAPS })
        ));

        let frame = IpcFrame::build(0, 1, 1, &[], &caps[..2]).unwrap();
        assert_eq!(frame.cap_count(), 2);
        assert_eq!(frame.caps().collect::<Vec<_>>(), vec![CapNodeId(1), CapNodeId(2)]);
    }

    #[test]
    fn tag_word_layout() {
        let tag = pack_tag(0xDEAD_BEEF, 0x0203, 2, FLAG_INDIRECT);
        assert_eq!(tag as u32, 0xDEAD_BEEF);
        assert_eq!((tag >> 32) as u16, 0x0203);
        assert_eq!((tag >> 48) as u8, 2);
        assert_eq!((tag >> 56) as u8, FLAG_INDIRECT);
    }
}
