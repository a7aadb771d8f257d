//! Kernel error codes
//!
//! Mirrors the seL4 error space the bus consumes, narrowed to the
//! operations this substrate exposes.

use thiserror::Error;

use crate::cdt::CapNodeId;
use crate::object::ObjectId;
use crate::process::ProcessId;
use crate::rights::Rights;

/// Errors returned by kernel invocations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("invalid object {0}")]
    InvalidObject(ObjectId),

    #[error("object {0} was destroyed")]
    ObjectDestroyed(ObjectId),

    #[error("object {0} is not an endpoint")]
    NotAnEndpoint(ObjectId),

    #[error("process {holder} does not own object {object}")]
    NotOwner { object: ObjectId, holder: ProcessId },

    #[error("unknown capability {0}")]
    InvalidCapability(CapNodeId),

    #[error("capability {0} has been revoked")]
    CapabilityRevoked(CapNodeId),

    #[error("capability {node} is not held by process {holder}")]
    NotHolder { node: CapNodeId, holder: ProcessId },

    #[error("insufficient rights: required {required:?}, held {held:?}")]
    InsufficientRights { required: Rights, held: Rights },

    #[error("invalid process {0}")]
    InvalidProcess(ProcessId),

    #[error("rendezvous timed out")]
    Timeout,

    #[error("too many capabilities attached ({count}, max {max})")]
    TooManyCaps { count: usize, max: usize },

    #[error("payload of {0} bytes exceeds the message ABI")]
    PayloadTooLarge(usize),
}

pub type Result<T> = core::result::Result<T, KernelError>;
