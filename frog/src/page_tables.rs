//! Host page tables.
//!
//! In root mode every processor runs on one shared set of page tables:
//!
//! - PML4 entries 256..512 are copied from the System process, so every kernel
//!   address the driver used keeps working. The copy is shallow: the tables
//!   below those entries stay owned by the OS.
//! - PML4 entry [`HOST_PHYSICAL_MEMORY_PML4_INDEX`] maps the first 128 GiB of
//!   physical memory with 2 MiB pages, at
//!   `HOST_PHYSICAL_MEMORY_BASE + pa`.
//!
//! Nothing above 128 GiB is mapped. The set is built once, before any
//! processor enters VMX operation, and never changes.
use crate::platform::{AccessFault, Platform};
use abyss::{
    addressing::{
        Pa, Va, HOST_PHYSICAL_MEMORY_PML4_INDEX, HOST_PHYSICAL_MEMORY_SIZE, LARGE_PAGE_SIZE,
    },
    paging::{
        PageTable, PageTableMappingError, Pde, PdeFlags, Pdpe, PdpeFlags, Pml4e, Pml4eFlags,
    },
    x86_64::CR3_PFN_MASK,
    ENTRY_COUNT,
};
use alloc::{boxed::Box, vec};

/// Number of page directories of the physical memory map.
pub const PHYSICAL_MAP_DIRECTORIES: usize = (HOST_PHYSICAL_MEMORY_SIZE >> 30) as usize;

/// Errors while building the host page tables.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// A table has no physical address.
    Untranslatable,
    /// The System page tables could not be read.
    SystemTable(AccessFault),
    /// An entry could not be written.
    Mapping(PageTableMappingError),
}

impl From<PageTableMappingError> for PageTableError {
    fn from(e: PageTableMappingError) -> Self {
        Self::Mapping(e)
    }
}

impl From<AccessFault> for PageTableError {
    fn from(e: AccessFault) -> Self {
        Self::SystemTable(e)
    }
}

/// The page tables the hypervisor runs on.
pub struct HostPageTables {
    pml4: Box<PageTable<Pml4e>>,
    pdpt: Box<PageTable<Pdpe>>,
    pds: Box<[PageTable<Pde>]>,
    cr3: Pa,
}

fn physical<P: Platform, T>(platform: &P, table: &T) -> Result<Pa, PageTableError> {
    platform
        .physical_address_of(table as *const T as *const u8)
        .ok_or(PageTableError::Untranslatable)
}

impl HostPageTables {
    /// Build the host page tables from the System process' `system_cr3`.
    pub fn prepare<P: Platform>(platform: &P, system_cr3: u64) -> Result<Self, PageTableError> {
        let mut pml4 = Box::new(PageTable::filled(Pml4e::EMPTY));
        let mut pdpt = Box::new(PageTable::filled(Pdpe::EMPTY));
        let mut pds =
            vec![PageTable::filled(Pde::EMPTY); PHYSICAL_MAP_DIRECTORIES].into_boxed_slice();

        // Kernel half.
        let mut upper = [0u8; ENTRY_COUNT / 2 * 8];
        let system_pml4 = Pa::new(system_cr3 & CR3_PFN_MASK).ok_or(PageTableError::Untranslatable)?;
        platform.read_physical(system_pml4 + (ENTRY_COUNT as u64 / 2) * 8, &mut upper)?;
        for (e, raw) in pml4[ENTRY_COUNT / 2..].iter_mut().zip(upper.chunks_exact(8)) {
            let mut b = [0; 8];
            b.copy_from_slice(raw);
            *e = Pml4e(u64::from_le_bytes(b));
        }

        // Physical memory map. The user bit stays clear: supervisor only.
        for (i, pd) in pds.iter_mut().enumerate() {
            for (j, pde) in pd.iter_mut().enumerate() {
                let frame = ((i * ENTRY_COUNT + j) as u64) * LARGE_PAGE_SIZE;
                pde.set_perm(PdeFlags::P | PdeFlags::RW | PdeFlags::PS)
                    .set_pa(Pa::new(frame).ok_or(PageTableError::Untranslatable)?)?;
            }
            pdpt[i]
                .set_perm(PdpeFlags::P | PdpeFlags::RW)
                .set_pa(physical(platform, pd)?)?;
        }
        pml4[HOST_PHYSICAL_MEMORY_PML4_INDEX]
            .set_perm(Pml4eFlags::P | Pml4eFlags::RW)
            .set_pa(physical(platform, &*pdpt)?)?;

        let cr3 = physical(platform, &*pml4)?;
        Ok(Self {
            pml4,
            pdpt,
            pds,
            cr3,
        })
    }

    /// Value to load into the host CR3 field.
    pub fn cr3(&self) -> Pa {
        self.cr3
    }

    /// Entry `index` of the PML4.
    pub fn pml4e(&self, index: usize) -> Pml4e {
        self.pml4[index]
    }

    /// Translate a host virtual address inside the physical memory map.
    ///
    /// Walks the tables the way the processor does and returns `None` for any
    /// address outside the map.
    pub fn resolve_physical_map(&self, va: Va) -> Option<Pa> {
        if va.pml4_index() != HOST_PHYSICAL_MEMORY_PML4_INDEX {
            return None;
        }
        self.pml4[HOST_PHYSICAL_MEMORY_PML4_INDEX].pa()?;
        let pdpe = self.pdpt[va.pdpt_index()];
        pdpe.pa()?;
        let pd = self.pds.get(va.pdpt_index())?;
        let pde = pd[va.pd_index()];
        if !pde.is_large() {
            return None;
        }
        pde.pa().map(|frame| frame + (va.into_u64() & (LARGE_PAGE_SIZE - 1)))
    }
}
