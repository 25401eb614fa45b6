//! Per-processor state.
use crate::{ept::Ept, platform::Platform};
use abyss::x86_64::{GeneralPurposeRegisters, PrivilegeLevel};

/// State the hypervisor keeps for one logical processor.
pub struct Vcpu {
    id: usize,
    /// Extended page tables of this processor.
    pub ept: Ept,
    /// Set by the unload hypercall. The exit handler devirtualizes the
    /// processor before it would resume the guest.
    pub stop_virtualization: bool,
    virtualized: bool,
}

impl Vcpu {
    pub(crate) fn new<P: Platform>(platform: &P, id: usize) -> Result<Self, crate::ept::EptError> {
        Ok(Self {
            id,
            ept: Ept::new(platform)?,
            stop_virtualization: false,
            virtualized: true,
        })
    }

    /// Index of this processor.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this processor still runs the guest under the hypervisor.
    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }

    pub(crate) fn devirtualize(&mut self) {
        self.virtualized = false;
        self.stop_virtualization = false;
    }
}

/// Guest state saved by the exit stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestState {
    /// General purpose registers.
    pub regs: GeneralPurposeRegisters,
    /// Guest CR3 at the exit.
    pub cr3: u64,
    /// Guest CPL at the exit.
    pub cpl: PrivilegeLevel,
    /// Guest rip at the exit.
    pub rip: u64,
}

impl GuestState {
    /// A ring 0 guest on the address space `cr3`.
    pub fn new(cr3: u64) -> Self {
        Self {
            regs: GeneralPurposeRegisters::default(),
            cr3,
            cpl: PrivilegeLevel::Ring0,
            rip: 0,
        }
    }

    /// The six hypercall argument registers.
    pub fn hypercall_args(&self) -> [u64; 6] {
        let r = &self.regs;
        [r.rcx, r.rdx, r.r8, r.r9, r.r10, r.r11]
    }
}
