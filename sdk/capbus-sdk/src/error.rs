//! SDK errors

use std::path::PathBuf;

use cap_broker::CapabilityError;
use capbus_ipc::ChannelError;
use capbus_router::{BusError, ErrorKind};
use capbus_schema::SchemaError;
use thiserror::Error;

/// SDK error types
#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("{0} has exited")]
    ProcessExited(String),

    #[error("could not start worker thread: {0}")]
    Spawn(String),
}

impl SdkError {
    /// Bus-wide classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdkError::Bus(e) => e.kind(),
            SdkError::Capability(e) => BusError::from(e.clone()).kind(),
            SdkError::Channel(e) => BusError::from(e.clone()).kind(),
            SdkError::Schema(e) => BusError::from(e.clone()).kind(),
            SdkError::ProcessExited(_) => ErrorKind::PeerUnavailable,
            SdkError::Io { .. } | SdkError::Toml(_) | SdkError::Manifest(_) | SdkError::Spawn(_) => {
                ErrorKind::Other
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, SdkError>;
