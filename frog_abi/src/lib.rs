//! Wire ABI shared by the fr0g hypervisor and its clients.
//!
//! Both sides of the `vmcall` boundary link this crate, so the numbering of
//! hypercalls, the register convention, the log record layout and the
//! mailbox vocabulary are defined exactly once.

#![cfg_attr(not(test), no_std)]

pub mod hypercall;
pub mod log;
pub mod message;

pub use hypercall::{HypercallCode, HypercallInput};
pub use log::LogRecord;

/// Key carried in the upper 56 bits of RAX by every hypercall.
///
/// The key only filters stray `vmcall`s; it is not a secret.
pub const HYPERCALL_KEY: u64 = 69420;

/// Value returned by the ping hypercall: the ascii bytes `fr0g`.
pub const HYPERVISOR_SIGNATURE: u64 = 0x6672_3067;

/// Result of any hypercall that failed or was rejected.
pub const HYPERCALL_FAILURE: u64 = 0;

bitflags::bitflags! {
    /// Accesses watched by a memory monitoring region.
    pub struct MmrMode: u8 {
        /// Data reads.
        const R = 0b001;
        /// Data writes.
        const W = 0b010;
        /// Instruction fetches.
        const X = 0b100;
    }
}
