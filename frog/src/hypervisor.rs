//! The process-wide hypervisor state.
//!
//! [`Hypervisor::start`] builds everything up front on one processor: the
//! host page tables, one EPT per logical processor, the log ring and the
//! mailbox. Either all of it is built or nothing is. Once started, the
//! trampolines call [`Hypervisor::handle_vmexit`] on every exit and the
//! hypervisor no longer allocates.
use crate::{
    config::{HypervisorConfig, MAX_VCPUS},
    ept::EptError,
    hypercall,
    logger::Logger,
    mailbox::Mailbox,
    page_tables::{HostPageTables, PageTableError},
    platform::Platform,
    vcpu::{GuestState, Vcpu},
    vmexit::{VmError, VmExit, VmexitController, VmexitResult, CONTROLLERS},
};
use alloc::{boxed::Box, vec::Vec};
use core::fmt;
use crossbeam_utils::CachePadded;
use frog_abi::{HypercallInput, HYPERCALL_FAILURE};
use spin_lock::SpinLock;

/// Reasons the hypervisor failed to start.
#[derive(Debug, PartialEq, Eq)]
pub enum StartError {
    /// Zero processors, or more than [`MAX_VCPUS`].
    InvalidVcpuCount(usize),
    /// The host page tables could not be built.
    PageTables(PageTableError),
    /// The EPT of processor `cpu` could not be built.
    Ept {
        /// Processor index.
        cpu: usize,
        /// Cause.
        error: EptError,
    },
}

impl From<PageTableError> for StartError {
    fn from(e: PageTableError) -> Self {
        Self::PageTables(e)
    }
}

/// The hypervisor.
pub struct Hypervisor<P: Platform> {
    platform: P,
    config: HypervisorConfig,
    host_page_tables: HostPageTables,
    logger: Logger,
    mailbox: Mailbox,
    vcpus: Box<[CachePadded<SpinLock<Vcpu>>]>,
}

impl<P: Platform> Hypervisor<P> {
    /// Build the hypervisor state for `config.vcpu_count` processors.
    pub fn start(platform: P, config: HypervisorConfig) -> Result<Self, StartError> {
        if config.vcpu_count == 0 || config.vcpu_count > MAX_VCPUS {
            return Err(StartError::InvalidVcpuCount(config.vcpu_count));
        }
        let host_page_tables = HostPageTables::prepare(&platform, config.system_cr3)?;
        let vcpus = (0..config.vcpu_count)
            .map(|cpu| {
                Vcpu::new(&platform, cpu)
                    .map(|vcpu| CachePadded::new(SpinLock::new(vcpu)))
                    .map_err(|error| StartError::Ept { cpu, error })
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();

        let hv = Self {
            platform,
            config,
            host_page_tables,
            logger: Logger::default(),
            mailbox: Mailbox::new(),
            vcpus,
        };
        info!(hv, 0, "virtualizing {} processors.", hv.vcpu_count());
        info!(hv, 0, "host cr3 {:#x}.", hv.host_page_tables.cr3().into_u64());
        Ok(hv)
    }

    /// Devirtualize every processor and tear the hypervisor down.
    pub fn stop(self) -> P {
        for vcpu in self.vcpus.iter() {
            vcpu.lock().devirtualize();
        }
        self.platform
    }

    /// The machine.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Start-up configuration.
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Host page tables.
    pub fn host_page_tables(&self) -> &HostPageTables {
        &self.host_page_tables
    }

    /// The log ring.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// The mailbox.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Number of processors.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Run `f` on the state of processor `cpu`.
    pub fn with_vcpu<R>(&self, cpu: usize, f: impl FnOnce(&mut Vcpu) -> R) -> Option<R> {
        self.vcpus.get(cpu).map(|vcpu| f(&mut vcpu.lock()))
    }

    /// Whether processor `cpu` runs under the hypervisor.
    pub fn is_virtualized(&self, cpu: usize) -> bool {
        self.with_vcpu(cpu, |vcpu| vcpu.is_virtualized())
            .unwrap_or(false)
    }

    /// Append a record to the log ring on behalf of processor `cpu`.
    ///
    /// Use the [`info!`], [`warning!`] and [`debug!`] macros instead of
    /// calling this directly.
    pub fn log(&self, cpu: usize, args: fmt::Arguments<'_>) -> u64 {
        self.logger.write(self.platform.timestamp(), cpu as u32, args)
    }

    /// Serve a `vmcall` of processor `cpu`. Returns the value for rax.
    ///
    /// A processor that left VMX operation no longer traps, so its calls fail.
    pub fn vmx_vmcall(&self, cpu: usize, guest: &GuestState, input: &HypercallInput) -> u64 {
        if !input.is_authentic() {
            return HYPERCALL_FAILURE;
        }
        let vcpu = match self.vcpus.get(cpu) {
            Some(vcpu) => vcpu,
            None => return HYPERCALL_FAILURE,
        };
        let mut vcpu = vcpu.lock();
        if !vcpu.is_virtualized() {
            return HYPERCALL_FAILURE;
        }
        hypercall::dispatch(self, cpu, &mut vcpu, guest, input)
    }

    /// Handle one VM exit of processor `cpu`.
    ///
    /// Once an unload hypercall asked for it, the processor is devirtualized
    /// instead of resuming the guest.
    pub fn handle_vmexit(
        &self,
        cpu: usize,
        exit: &VmExit,
        guest: &mut GuestState,
    ) -> Result<VmexitResult, VmError> {
        let mut vcpu = self.vcpus.get(cpu).ok_or(VmError::NoSuchVcpu(cpu))?.lock();
        let result = CONTROLLERS.handle(self, &mut vcpu, exit, guest);
        if vcpu.stop_virtualization {
            vcpu.devirtualize();
            info!(self, cpu, "devirtualized.");
            return Ok(VmexitResult::Devirtualize);
        }
        if let Err(e) = &result {
            warning!(self, cpu, "unhandled exit {:?} at rip {:#x}.", e, guest.rip);
        }
        result
    }
}
