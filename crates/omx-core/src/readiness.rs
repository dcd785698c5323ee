//! Readiness flags and wait modes.

use bitflags::bitflags;

bitflags! {
    /// Conditions reported by [`crate::Session::poll`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u8 {
        /// A read will not block (data queued, or the session failed).
        const READABLE = 0b001;
        /// A write will not block. Always set: the transport has no flow
        /// control.
        const WRITABLE = 0b010;
        /// The remote endpoint is gone.
        const ERROR = 0b100;
    }
}

/// Whether an operation may suspend the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Suspend until the operation can complete (or is cancelled).
    #[default]
    Blocking,
    /// Fail with a transient error instead of suspending.
    NonBlocking,
}
