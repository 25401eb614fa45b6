//! fr0g, a stealth hypervisor that virtualizes a running system in place.
//!
//! Once every logical processor runs as a guest, the hypervisor only wakes up on
//! VM exits. It offers the guest a narrow, key-filtered hypercall channel and a
//! set of EPT tricks the guest cannot observe:
//!
//! - execute hooks, where instruction fetches of a frame see a shadow frame
//!   while reads and writes still see the original;
//! - hidden pages, whose guest-physical mapping points at a zeroed scrub page
//!   and whose writes are dropped;
//! - memory monitoring regions, which log every matching access and then let
//!   the access complete.
//!
//! ## Layout
//! - [`platform`]: the seam to physical memory, the processor and the OS.
//! - [`page_tables`]: the page tables the hypervisor runs on in root mode.
//! - [`ept`]: per-processor extended page tables and the stealth engine.
//! - [`logger`] and [`mailbox`]: the two channels that leave root mode.
//! - [`guest`]: guest page walks and copies between guest and physical memory.
//! - [`hypercall`]: the gateway and its handlers.
//! - [`vmexit`], [`vcpu`] and [`hypervisor`]: the process-wide state and the
//!   entry points the VM-exit trampoline calls.
//!
//! Nothing here allocates after [`Hypervisor::start`] returns.
//!
//! [`Hypervisor::start`]: hypervisor::Hypervisor::start

#![cfg_attr(not(any(test, feature = "testing")), no_std)]

extern crate alloc;

#[macro_use]
pub mod logger;

pub mod config;
pub mod ept;
pub mod guest;
pub mod hypercall;
pub mod hypervisor;
pub mod mailbox;
pub mod page_tables;
pub mod platform;
pub mod vcpu;
pub mod vmexit;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use hypervisor::{Hypervisor, StartError};
pub use platform::Platform;
