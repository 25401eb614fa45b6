//! VM exits the hypervisor handles.
//!
//! The exit trampoline saves the guest registers, reads the exit information
//! out of the VMCS and calls [`Hypervisor::handle_vmexit`]. Each kind of exit
//! has its own [`VmexitController`]; controllers are chained as tuples and the
//! first one that recognises the exit handles it.
//!
//! [`Hypervisor::handle_vmexit`]: crate::Hypervisor::handle_vmexit
use crate::{
    ept::{EptError, EptViolation, ViolationOutcome},
    hypercall,
    hypervisor::Hypervisor,
    platform::Platform,
    vcpu::{GuestState, Vcpu},
};
use abyss::{addressing::Gpa, ept::ViolationQualification};
use frog_abi::HypercallInput;
use num_enum::TryFromPrimitive;

/// Basic exit reasons the hypervisor cares about.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum BasicExitReason {
    /// The guest executed `cpuid`.
    Cpuid = 10,
    /// The guest executed `vmcall`.
    Vmcall = 18,
    /// An instruction retired with the monitor trap flag set.
    MonitorTrapFlag = 37,
    /// A guest access the EPT did not allow.
    EptViolation = 48,
    /// A malformed EPT entry.
    EptMisconfig = 49,
}

/// Exit information read out of the VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmExit {
    /// Why the guest exited.
    pub reason: BasicExitReason,
    /// Exit qualification.
    pub qualification: u64,
    /// Guest physical address, for EPT exits.
    pub guest_physical_address: u64,
    /// Length of the instruction that exited.
    pub instruction_length: u64,
}

impl VmExit {
    /// Decode the raw exit reason field. `None` for reasons not handled here.
    pub fn new(
        reason: u32,
        qualification: u64,
        guest_physical_address: u64,
        instruction_length: u64,
    ) -> Option<Self> {
        Some(Self {
            reason: BasicExitReason::try_from((reason & 0xffff) as u16).ok()?,
            qualification,
            guest_physical_address,
            instruction_length,
        })
    }
}

/// Possible result of the Vmexit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmexitResult {
    /// Resume the guest.
    Ok,
    /// Resume the guest with the monitor trap flag set.
    SingleStep,
    /// Leave VMX operation on this processor and continue the guest natively.
    Devirtualize,
}

/// Possible errors on a VM exit.
#[derive(Debug, PartialEq, Eq)]
pub enum VmError {
    /// No controller handles this exit.
    HandleVmexitFailed(BasicExitReason),
    /// An EPT violation that no stealth primitive explains.
    UnhandledEptViolation(EptViolation),
    /// The EPT could not be updated.
    Ept(EptError),
    /// No such processor.
    NoSuchVcpu(usize),
}

impl From<EptError> for VmError {
    fn from(e: EptError) -> Self {
        Self::Ept(e)
    }
}

/// Controller that defines action on vmexit.
pub trait VmexitController<P: Platform> {
    /// Handle the vmexit on this controller.
    ///
    /// Returns [`VmError::HandleVmexitFailed`] when this controller does not
    /// handle the exit.
    fn handle(
        &self,
        hv: &Hypervisor<P>,
        vcpu: &mut Vcpu,
        exit: &VmExit,
        guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError>;
}

impl<P: Platform> VmexitController<P> for () {
    fn handle(
        &self,
        _hv: &Hypervisor<P>,
        _vcpu: &mut Vcpu,
        exit: &VmExit,
        _guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        Err(VmError::HandleVmexitFailed(exit.reason))
    }
}

impl<P: Platform, A: VmexitController<P>, B: VmexitController<P>> VmexitController<P> for (A, B) {
    fn handle(
        &self,
        hv: &Hypervisor<P>,
        vcpu: &mut Vcpu,
        exit: &VmExit,
        guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        let (a, b) = self;
        match a.handle(hv, vcpu, exit, guest) {
            Err(VmError::HandleVmexitFailed(_)) => b.handle(hv, vcpu, exit, guest),
            r => r,
        }
    }
}

/// Hypercall vmexit controller.
pub struct HypercallController;

impl<P: Platform> VmexitController<P> for HypercallController {
    fn handle(
        &self,
        hv: &Hypervisor<P>,
        vcpu: &mut Vcpu,
        exit: &VmExit,
        guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        if exit.reason != BasicExitReason::Vmcall {
            return Err(VmError::HandleVmexitFailed(exit.reason));
        }
        let input = HypercallInput::from_registers(guest.regs.rax, guest.hypercall_args());
        let cpu = vcpu.id();
        let result = hypercall::dispatch(hv, cpu, vcpu, guest, &input);
        guest.regs.rax = result;
        guest.rip = guest.rip.wrapping_add(exit.instruction_length);
        Ok(VmexitResult::Ok)
    }
}

/// EPT violation controller.
///
/// Hook view switches are silent. Every access to a monitoring region is
/// logged and then single stepped. Writes to hidden pages are single stepped
/// into the sink page.
pub struct EptController;

impl<P: Platform> VmexitController<P> for EptController {
    fn handle(
        &self,
        hv: &Hypervisor<P>,
        vcpu: &mut Vcpu,
        exit: &VmExit,
        guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        if exit.reason != BasicExitReason::EptViolation {
            return Err(VmError::HandleVmexitFailed(exit.reason));
        }
        let gpa = Gpa::new(exit.guest_physical_address).ok_or(VmError::Ept(EptError::OutOfRange))?;
        let violation = EptViolation::from_exit(
            gpa,
            ViolationQualification::from_bits_truncate(exit.qualification),
        );
        match vcpu.ept.handle_violation(&violation)? {
            ViolationOutcome::HookViewSwitched(flush) => {
                flush.flush(hv.platform());
                Ok(VmexitResult::Ok)
            }
            ViolationOutcome::SingleStep { mmr, flush } => {
                flush.flush(hv.platform());
                info!(
                    hv,
                    vcpu.id(),
                    "MMR {:#x}+{:#x} {:?} at {:#x} by rip {:#x} cr3 {:#x}.",
                    mmr.start.into_u64(),
                    mmr.size,
                    violation.access,
                    gpa.into_u64(),
                    guest.rip,
                    guest.cr3
                );
                Ok(VmexitResult::SingleStep)
            }
            ViolationOutcome::HiddenWriteDiverted(flush) => {
                flush.flush(hv.platform());
                debug!(
                    hv,
                    vcpu.id(),
                    "Write to hidden {:#x} by rip {:#x} diverted.",
                    gpa.into_u64(),
                    guest.rip
                );
                Ok(VmexitResult::SingleStep)
            }
            ViolationOutcome::Unhandled => Err(VmError::UnhandledEptViolation(violation)),
        }
    }
}

/// Monitor trap flag controller. Closes the page a monitoring region opened.
pub struct MonitorTrapController;

impl<P: Platform> VmexitController<P> for MonitorTrapController {
    fn handle(
        &self,
        hv: &Hypervisor<P>,
        vcpu: &mut Vcpu,
        exit: &VmExit,
        _guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        if exit.reason != BasicExitReason::MonitorTrapFlag {
            return Err(VmError::HandleVmexitFailed(exit.reason));
        }
        if let Some(flush) = vcpu.ept.complete_single_step()? {
            flush.flush(hv.platform());
        }
        Ok(VmexitResult::Ok)
    }
}

/// Every controller of the hypervisor, in the order they are asked.
pub type Controllers = (HypercallController, (EptController, (MonitorTrapController, ())));

/// The controller chain.
pub const CONTROLLERS: Controllers =
    (HypercallController, (EptController, (MonitorTrapController, ())));
