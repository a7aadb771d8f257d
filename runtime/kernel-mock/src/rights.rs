//! Capability rights
//!
//! Rights control what operations can be performed on an object through
//! a capability. Rights can only be reduced (never added) during derivation.

use bitflags::bitflags;

bitflags! {
    /// Rights mask carried by every capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u8 {
        /// May send on the endpoint
        const SEND = 0b0001;
        /// May receive on the endpoint
        const RECEIVE = 0b0010;
        /// May attach capabilities to messages / transfer them
        const GRANT = 0b0100;
        /// May revoke this capability and everything derived from it
        const REVOKE = 0b1000;
    }
}

impl Rights {
    /// Rights of a freshly created endpoint
    pub const ENDPOINT_OWNER: Self = Self::all();
}
