//! The hypercall gateway.
//!
//! A `vmcall` from the guest traps into the hypervisor with the hypercall in
//! rax and its arguments in rcx, rdx, r8, r9, r10 and r11. The gateway drops
//! every call whose key is wrong, looks the code up in a table of plain
//! functions and hands the single result back in rax.
//!
//! No handler faults the guest. Failures are reported in band: `0` means the
//! call failed, anything else is a success value or a handle.
use crate::{hypervisor::Hypervisor, platform::Platform, vcpu::GuestState, vcpu::Vcpu};
use frog_abi::{HypercallCode, HypercallInput, HYPERCALL_FAILURE};

mod handlers;

/// Everything a handler may touch.
pub struct HypercallCtx<'a, P: Platform> {
    /// The hypervisor.
    pub hv: &'a Hypervisor<P>,
    /// Calling processor.
    pub cpu: usize,
    /// State of the calling processor, locked for the duration of the call.
    pub vcpu: &'a mut Vcpu,
    /// Guest registers at the `vmcall`.
    pub guest: &'a GuestState,
    /// rcx, rdx, r8, r9, r10, r11.
    pub args: [u64; 6],
}

/// A hypercall handler. Returns the value placed in rax.
pub type Handler<P> = fn(&mut HypercallCtx<'_, P>) -> u64;

/// Handlers indexed by [`HypercallCode`].
pub fn table<P: Platform>() -> [Handler<P>; HypercallCode::COUNT] {
    [
        handlers::ping,
        handlers::test,
        handlers::unload,
        handlers::read_phys_mem,
        handlers::write_phys_mem,
        handlers::read_virt_mem,
        handlers::write_virt_mem,
        handlers::query_process_cr3,
        handlers::install_ept_hook,
        handlers::remove_ept_hook,
        handlers::flush_logs,
        handlers::get_physical_address,
        handlers::hide_physical_page,
        handlers::unhide_physical_page,
        handlers::get_hv_base,
        handlers::install_mmr,
        handlers::remove_mmr,
        handlers::remove_all_mmrs,
        handlers::send_message,
        handlers::get_message,
        handlers::get_message_type,
        handlers::get_message_time,
        handlers::get_message_sender,
    ]
}

/// Authenticate `input` and run its handler.
pub fn dispatch<P: Platform>(
    hv: &Hypervisor<P>,
    cpu: usize,
    vcpu: &mut Vcpu,
    guest: &GuestState,
    input: &HypercallInput,
) -> u64 {
    if !input.is_authentic() {
        return HYPERCALL_FAILURE;
    }
    let code = match input.hypercall() {
        Some(code) => code,
        None => return HYPERCALL_FAILURE,
    };
    let mut ctx = HypercallCtx {
        hv,
        cpu,
        vcpu,
        guest,
        args: input.args,
    };
    table::<P>()[u8::from(code) as usize](&mut ctx)
}
