//! Process identity
//!
//! The kernel only tracks who a process is and whether it is still alive.
//! Scheduling belongs to the host: every process is an ordinary thread.

use core::fmt;

/// Kernel-assigned process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) u64);

impl ProcessId {
    /// Raw identifier value
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProcessRecord {
    pub name: String,
    pub alive: bool,
}
