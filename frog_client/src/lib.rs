//! Client side of the fr0g hypercall channel.
//!
//! The same code runs in the driver that loads the hypervisor and in user-mode
//! tools that talk to it. A [`Hypercaller`] performs the trap, a [`Client`]
//! wraps every hypercall in a typed method and adds the blocking mailbox wait,
//! and the free functions in [`cpu`], [`hide`] and [`driver`] build the
//! multi-processor flows on top of it.
//!
//! Every wrapper returns what the hypervisor put in rax: `0` means failure.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod client;
pub mod clock;
pub mod cpu;
pub mod driver;
pub mod hide;
pub mod transport;

pub use client::{Client, POLL_INTERVAL_MS};
pub use clock::Clock;
pub use cpu::{for_each_cpu, Processors};
pub use driver::{announce_loaded, unload_all, wait_until_loaded};
pub use hide::{hide_hypervisor, HideReport};
pub use transport::{Hypercaller, NotVirtualized};
