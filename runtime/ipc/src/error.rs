use cap_broker::{CapabilityError, ObjectId};
use thiserror::Error;

use crate::channel::Direction;

/// Channel error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel carries schema {expected:#010x}, message has {actual:#010x}")]
    SchemaMismatch { expected: u32, actual: u32 },

    #[error("channel has no {0} direction bound")]
    NotBound(Direction),

    #[error("capability does not reference an endpoint ({0})")]
    NotAnEndpoint(ObjectId),

    #[error("peer endpoint {0} is unavailable")]
    PeerUnavailable(ObjectId),

    #[error("rendezvous timed out")]
    Timeout,

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

pub type Result<T> = core::result::Result<T, ChannelError>;
