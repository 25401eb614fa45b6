//! Capacities and start-up configuration.
use abyss::addressing::Gpa;

/// Maximum number of logical processors.
pub const MAX_VCPUS: usize = 256;

/// 4 KiB tables each processor's EPT may use to split 2 MiB pages.
pub const EPT_SPLIT_POOL_PAGES: usize = 100;

/// Execute hooks per processor.
pub const EPT_HOOK_COUNT: usize = 64;

/// Memory monitoring regions per processor.
pub const EPT_MMR_COUNT: usize = 32;

/// Records kept by the log ring before the oldest is dropped.
pub const LOG_CAPACITY: usize = 512;

/// Guest-physical memory identity mapped by each EPT.
pub const EPT_COVERAGE: u64 = 512 << 30;

/// Process id of the System process.
pub const SYSTEM_PID: u64 = 4;

/// Processes visited before a process lookup gives up.
pub const MAX_PROCESS_WALK: usize = 4096;

/// Whether `gpa` lies inside the identity EPT.
#[inline]
pub const fn ept_covers(gpa: Gpa) -> bool {
    gpa.into_u64() < EPT_COVERAGE
}

/// Kernel structure layout needed to find a process' address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntrospectionConfig {
    /// Kernel virtual address of the System process object.
    pub system_eprocess: u64,
    /// Offset of the process id in a process object. The active process
    /// links immediately follow it.
    pub unique_process_id_offset: u64,
    /// Offset of the directory table base (kernel CR3) in a process object.
    pub directory_table_base_offset: u64,
}

impl IntrospectionConfig {
    /// Offset of the active process list entry in a process object.
    pub const fn active_process_links_offset(&self) -> u64 {
        self.unique_process_id_offset + 8
    }
}

/// Values the driver hands to [`Hypervisor::start`].
///
/// [`Hypervisor::start`]: crate::Hypervisor::start
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypervisorConfig {
    /// Number of logical processors to virtualize.
    pub vcpu_count: usize,
    /// CR3 of the System process.
    pub system_cr3: u64,
    /// Kernel virtual address of the hypervisor image.
    pub image_base: u64,
    /// Size of the hypervisor image in bytes.
    pub image_size: u64,
    /// Absent when the driver could not resolve the kernel layout.
    pub introspection: Option<IntrospectionConfig>,
}
