//! Mailbox vocabulary.
//!
//! The mailbox carries a 64-bit content, a type, a millisecond timestamp and a
//! sender id. Content values start at 1 so that the 0 returned by a timed out
//! wait never looks like a message.

/// Sender ids.
pub mod sender {
    /// Reserved for the driver that loads the hypervisor.
    pub const DRIVER: u64 = 0;
}

/// Message types.
pub mod kind {
    /// Untyped message.
    pub const GENERIC: u64 = 0;
    /// Announcement of the driver's load state.
    pub const LOAD_STATE: u64 = 1;
}

/// Contents of [`kind::LOAD_STATE`] messages.
pub mod load_state {
    /// Every processor is virtualized.
    pub const LOADED: u64 = 1;
    /// Virtualization failed and nothing is left running.
    pub const FAILED_LOADING: u64 = 2;
    /// The driver is about to devirtualize every processor.
    pub const UNLOADING: u64 = 3;
}
