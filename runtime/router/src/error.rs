//! Bus error taxonomy

use core::fmt;

use cap_broker::CapabilityError;
use capbus_ipc::ChannelError;
use capbus_schema::SchemaError;
use thiserror::Error;

/// Uniform classification of every failure the bus reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidObject = 1,
    RightsExceeded = 2,
    CapabilityRevoked = 3,
    PeerUnavailable = 4,
    Timeout = 5,
    DuplicateSchema = 6,
    SchemaMismatch = 7,
    VersionIncompatible = 8,
    ServiceNotFound = 9,
    NameTaken = 10,
    Other = 255,
}

impl ErrorKind {
    /// Wire code used by the bootstrap protocol (`0` means success)
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            1 => ErrorKind::InvalidObject,
            2 => ErrorKind::RightsExceeded,
            3 => ErrorKind::CapabilityRevoked,
            4 => ErrorKind::PeerUnavailable,
            5 => ErrorKind::Timeout,
            6 => ErrorKind::DuplicateSchema,
            7 => ErrorKind::SchemaMismatch,
            8 => ErrorKind::VersionIncompatible,
            9 => ErrorKind::ServiceNotFound,
            10 => ErrorKind::NameTaken,
            255 => ErrorKind::Other,
            _ => return None,
        };
        Some(kind)
    }

    /// Timeouts are the only failures a caller may retry as-is
    #[inline]
    pub fn is_recoverable(self) -> bool {
        self == ErrorKind::Timeout
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Router error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no live service named {0:?}")]
    ServiceNotFound(String),

    #[error("name {0:?} is already bound")]
    NameTaken(String),

    #[error("topic {0:?} has not been declared")]
    TopicNotFound(String),

    #[error("subscription {0} does not exist")]
    NotSubscribed(u64),

    #[error("{name:?} is not owned by the caller")]
    NotOwner { name: String },

    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("expected schema {expected:#010x}, got {actual:#010x}")]
    SchemaMismatch { expected: u32, actual: u32 },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("call timed out")]
    Timeout,

    #[error("peer of {0:?} is unavailable")]
    PeerUnavailable(String),

    #[error("bus refused the request ({kind}): {detail}")]
    Remote { kind: ErrorKind, detail: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::ServiceNotFound(_) | BusError::TopicNotFound(_) => ErrorKind::ServiceNotFound,
            BusError::NameTaken(_) => ErrorKind::NameTaken,
            BusError::NotOwner { .. } => ErrorKind::RightsExceeded,
            BusError::SchemaMismatch { .. } | BusError::MalformedRequest(_) => {
                ErrorKind::SchemaMismatch
            }
            BusError::Timeout => ErrorKind::Timeout,
            BusError::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            BusError::NotSubscribed(_) | BusError::InvalidName(_) => ErrorKind::Other,
            BusError::Remote { kind, .. } => *kind,
            BusError::Schema(e) => schema_kind(e),
            BusError::Channel(e) => channel_kind(e),
            BusError::Capability(e) => capability_kind(e),
        }
    }
}

fn schema_kind(err: &SchemaError) -> ErrorKind {
    match err {
        SchemaError::DuplicateSchema { .. } => ErrorKind::DuplicateSchema,
        SchemaError::VersionIncompatible { .. } => ErrorKind::VersionIncompatible,
        SchemaError::UnknownSchema { .. }
        | SchemaError::SchemaMismatch { .. }
        | SchemaError::InvalidLayout(_) => ErrorKind::SchemaMismatch,
    }
}

fn channel_kind(err: &ChannelError) -> ErrorKind {
    match err {
        ChannelError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
        ChannelError::NotAnEndpoint(_) => ErrorKind::InvalidObject,
        ChannelError::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
        ChannelError::Timeout => ErrorKind::Timeout,
        ChannelError::NotBound(_) => ErrorKind::Other,
        ChannelError::Capability(e) => capability_kind(e),
    }
}

fn capability_kind(err: &CapabilityError) -> ErrorKind {
    match err {
        CapabilityError::InvalidObject(_) => ErrorKind::InvalidObject,
        CapabilityError::RightsExceeded { .. } | CapabilityError::NotOwner { .. } => {
            ErrorKind::RightsExceeded
        }
        CapabilityError::CapabilityRevoked(_) => ErrorKind::CapabilityRevoked,
        CapabilityError::UnknownBadge(_)
        | CapabilityError::NotHeld { .. }
        | CapabilityError::OutOfSlots
        | CapabilityError::Kernel(_) => ErrorKind::Other,
    }
}

pub type Result<T> = core::result::Result<T, BusError>;
