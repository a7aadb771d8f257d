//! Channels - schema-bound synchronous IPC for capbus
//!
//! # Purpose
//! A channel wraps one or two endpoint capabilities (one per direction) and
//! a schema id, and turns the kernel's register-level IPC into typed
//! message transfer.
//!
//! # Integration Points
//! - Depends on: `kernel-mock` (rendezvous), `cap-broker` (capability table)
//! - Provides to: Router, SDK
//! - IPC endpoints: whatever capabilities the channel is bound to
//! - Capabilities required: `SEND` outbound, `RECEIVE` inbound, `GRANT` to
//!   attach capabilities
//!
//! # Architecture
//! Every operation is one synchronous rendezvous. Nothing is queued inside
//! the channel: a send completes when a receiver has taken the message,
//! and throughput is set by how the two sides are scheduled.
//!
//! Messages are marshalled into the kernel's message-register ABI; payloads
//! beyond the inline registers travel in the indirect buffer.

mod channel;
mod error;
mod message;

pub use channel::{Channel, Direction};
pub use error::{ChannelError, Result};
pub use message::Message;
