//! The abyss of the hypervisor that speaks to the hardware.
//!
//! This crate holds the raw, fixed-layout structures the processor walks on our
//! behalf (host paging entries, extended page table entries, the exit
//! qualification of an EPT violation) together with the handful of
//! instructions that the rest of the hypervisor issues directly.
//!
//! Every structure here is a transparent wrapper around an integer. Fields are
//! reached only through accessors built on explicit masks and shifts, so the
//! layout never depends on compiler bit-packing.

#![cfg_attr(not(test), no_std)]

pub mod addressing;
pub mod ept;
pub mod paging;
pub mod x86_64;

/// Number of entries in every table of the 4-level paging hierarchy.
pub const ENTRY_COUNT: usize = 512;
