//! Channel implementation

use core::fmt;
use std::time::Duration;

use cap_broker::{Capability, CapabilityError, CapabilityManager, KernelError, ObjectId, Rights};
use capbus_schema::Version;
use kernel_mock::IpcFrame;

use crate::error::{ChannelError, Result};
use crate::message::Message;

/// Direction of a bound endpoint capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// A schema-bound path over one or two endpoint capabilities
///
/// Cloning shares the bound capabilities; the kernel serializes concurrent
/// senders on the same endpoint.
#[derive(Debug, Clone)]
pub struct Channel {
    caps: CapabilityManager,
    inbound: Option<Capability>,
    outbound: Option<Capability>,
    schema_id: u32,
    timeout: Option<Duration>,
}

impl Channel {
    /// Bind a single capability
    ///
    /// A capability with `RECEIVE` binds the inbound direction; otherwise
    /// one with `SEND` binds the outbound direction.
    pub fn open(caps: &CapabilityManager, local_cap: Capability, schema_id: u32) -> Result<Self> {
        let cap = checked_endpoint(caps, &local_cap)?;
        let (inbound, outbound) = if cap.has_rights(Rights::RECEIVE) {
            (Some(cap), None)
        } else if cap.has_rights(Rights::SEND) {
            (None, Some(cap))
        } else {
            return Err(ChannelError::Capability(CapabilityError::RightsExceeded {
                requested: Rights::SEND,
                held: cap.rights(),
            }));
        };

        Ok(Self {
            caps: caps.clone(),
            inbound,
            outbound,
            schema_id,
            timeout: None,
        })
    }

    /// Bind both directions
    pub fn duplex(
        caps: &CapabilityManager,
        inbound: Capability,
        outbound: Capability,
        schema_id: u32,
    ) -> Result<Self> {
        let inbound = checked_endpoint(caps, &inbound)?;
        let outbound = checked_endpoint(caps, &outbound)?;
        for (cap, needed) in [(&inbound, Rights::RECEIVE), (&outbound, Rights::SEND)] {
            if !cap.has_rights(needed) {
                return Err(ChannelError::Capability(CapabilityError::RightsExceeded {
                    requested: needed,
                    held: cap.rights(),
                }));
            }
        }

        Ok(Self {
            caps: caps.clone(),
            inbound: Some(inbound),
            outbound: Some(outbound),
            schema_id,
            timeout: None,
        })
    }

    /// Default bound for every blocking operation (`None` waits forever)
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub fn inbound(&self) -> Option<&Capability> {
        self.inbound.as_ref()
    }

    #[inline]
    pub fn outbound(&self) -> Option<&Capability> {
        self.outbound.as_ref()
    }

    /// Capability table the channel operates in
    #[inline]
    pub fn capabilities(&self) -> &CapabilityManager {
        &self.caps
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.send_timeout(message, self.timeout)
    }

    /// Block until a receiver takes `message`, or `timeout` elapses
    ///
    /// Attached capabilities leave this process's table once the transfer
    /// completes; on failure they stay where they were.
    pub fn send_timeout(&self, message: Message, timeout: Option<Duration>) -> Result<()> {
        if message.schema_id != self.schema_id {
            return Err(ChannelError::SchemaMismatch {
                expected: self.schema_id,
                actual: message.schema_id,
            });
        }
        let out = self
            .outbound
            .ok_or(ChannelError::NotBound(Direction::Outbound))?;

        let mut attached = Vec::with_capacity(message.caps.len());
        for cap in &message.caps {
            attached.push(self.caps.validate(cap)?.node());
        }

        let frame = IpcFrame::build(
            message.label,
            message.schema_id,
            message.version.raw(),
            &message.payload,
            &attached,
        )
        .map_err(|e| self.kernel_error(out.object().id, e))?;

        self.caps
            .kernel()
            .endpoint_send(self.caps.pid(), out.node(), frame, timeout)
            .map_err(|e| self.kernel_error(out.object().id, e))?;

        for cap in &message.caps {
            self.caps.forget(cap);
        }
        log::trace!(
            "{}: sent schema {:#010x} label {} ({} bytes, {} caps) on {}",
            self.caps.pid(),
            message.schema_id,
            message.label,
            message.payload.len(),
            attached.len(),
            out.object().id
        );
        Ok(())
    }

    pub fn receive(&self) -> Result<Message> {
        self.receive_timeout(self.timeout)
    }

    /// Block until a sender delivers a message, or `timeout` elapses
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Result<Message> {
        let inb = self
            .inbound
            .ok_or(ChannelError::NotBound(Direction::Inbound))?;

        let delivery = self
            .caps
            .kernel()
            .endpoint_recv(self.caps.pid(), inb.node(), timeout)
            .map_err(|e| self.kernel_error(inb.object().id, e))?;

        let mut caps = Vec::with_capacity(delivery.caps.len());
        for info in delivery.caps {
            caps.push(self.caps.adopt(info)?);
        }

        let frame = delivery.frame;
        let schema_id = frame.schema_id();
        if schema_id != self.schema_id {
            log::warn!(
                "{}: dropped message for schema {:#010x} on channel bound to {:#010x}",
                self.caps.pid(),
                schema_id,
                self.schema_id
            );
            for cap in &caps {
                let _ = self.caps.release(cap);
            }
            return Err(ChannelError::SchemaMismatch {
                expected: self.schema_id,
                actual: schema_id,
            });
        }

        let version = Version(frame.version());
        let label = frame.label();
        let badge = frame.badge();
        Ok(Message::received(
            schema_id,
            version,
            label,
            badge,
            frame.into_payload(),
            caps,
        ))
    }

    /// Release the bound capabilities
    pub fn close(self) -> Result<()> {
        for cap in [self.inbound, self.outbound].into_iter().flatten() {
            match self.caps.release(&cap) {
                Ok(()) | Err(CapabilityError::NotHeld { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn kernel_error(&self, object: ObjectId, err: KernelError) -> ChannelError {
        match err {
            KernelError::Timeout => ChannelError::Timeout,
            KernelError::ObjectDestroyed(id) => ChannelError::PeerUnavailable(id),
            KernelError::CapabilityRevoked(_) | KernelError::InvalidObject(_)
                if !self.caps.kernel().object_alive(object) =>
            {
                ChannelError::PeerUnavailable(object)
            }
            other => ChannelError::Capability(other.into()),
        }
    }
}

fn checked_endpoint(caps: &CapabilityManager, cap: &Capability) -> Result<Capability> {
    let cap = match caps.validate(cap) {
        Ok(cap) => cap,
        Err(CapabilityError::CapabilityRevoked(_))
            if !caps.kernel().object_alive(cap.object().id) =>
        {
            return Err(ChannelError::PeerUnavailable(cap.object().id))
        }
        Err(e) => return Err(e.into()),
    };
    if !cap.object().is_endpoint() {
        return Err(ChannelError::NotAnEndpoint(cap.object().id));
    }
    Ok(cap)
}
