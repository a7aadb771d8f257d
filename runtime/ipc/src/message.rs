use cap_broker::{Badge, Capability};
use capbus_schema::Version;

/// One message as a channel sends and receives it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub schema_id: u32,
    pub version: Version,
    /// Free-form word; the router uses it to correlate calls
    pub label: u64,
    pub payload: Vec<u8>,
    /// Outgoing: capabilities to transfer. Incoming: capabilities received.
    pub caps: Vec<Capability>,
    badge: Badge,
}

impl Message {
    pub fn new(schema_id: u32, version: Version, payload: Vec<u8>) -> Self {
        Self {
            schema_id,
            version,
            label: 0,
            payload,
            caps: Vec::new(),
            badge: 0,
        }
    }

    pub fn with_label(mut self, label: u64) -> Self {
        self.label = label;
        self
    }

    pub fn with_cap(mut self, cap: Capability) -> Self {
        self.caps.push(cap);
        self
    }

    /// Badge of the capability the message arrived through (0 before delivery)
    #[inline]
    pub fn badge(&self) -> Badge {
        self.badge
    }

    pub(crate) fn received(
        schema_id: u32,
        version: Version,
        label: u64,
        badge: Badge,
        payload: Vec<u8>,
        caps: Vec<Capability>,
    ) -> Self {
        Self {
            schema_id,
            version,
            label,
            payload,
            caps,
            badge,
        }
    }
}
