//! Per-processor extended page tables.
//!
//! Each logical processor owns one [`Ept`]. At start it identity maps the first
//! 512 GiB of guest-physical memory with 2 MiB pages, so the guest keeps
//! seeing exactly the memory it saw before virtualization.
//!
//! The stealth engine works on 4 KiB granularity. The first time a frame is
//! hooked, hidden or monitored, its 2 MiB page is split into a 4 KiB table
//! taken from a pool allocated at start. Splits are permanent, so a split
//! leaf can always be found again without allocation.
//!
//! The mutators never invalidate cached translations themselves. They return
//! an [`EptFlush`] which the caller hands the platform once it is done.
use crate::{
    config::{ept_covers, EPT_HOOK_COUNT, EPT_MMR_COUNT, EPT_SPLIT_POOL_PAGES},
    platform::Platform,
};
use abyss::{
    addressing::{Gpa, Pa, LARGE_PAGE_SIZE, PAGE_SIZE},
    ept::{
        EptMappingError, EptPde, EptPdpe, EptPml4e, EptPte, Eptp, MemoryType, Permission,
    },
    paging::PageTable,
    ENTRY_COUNT,
};
use alloc::{boxed::Box, vec, vec::Vec};

mod hide;
mod hook;
mod mmr;
mod violation;

pub use hook::EptHook;
pub use mmr::{Mmr, MmrHandle};
pub use violation::{EptViolation, ViolationOutcome};

/// A list specifying categories of EPT stealth engine error.
#[derive(Debug, PartialEq, Eq)]
pub enum EptError {
    /// Address beyond the identity mapped range.
    OutOfRange,
    /// The 2 MiB page holding the address was never split.
    NotSplit,
    /// No 4 KiB table left in the split pool.
    PoolExhausted,
    /// The frame is already hooked.
    Duplicated,
    /// The frame is used by another stealth primitive.
    Conflict,
    /// Every hook slot is in use.
    HookTableFull,
    /// Every monitoring region slot is in use.
    MmrTableFull,
    /// Empty or wrapping monitoring range.
    InvalidRange,
    /// Monitoring region that watches nothing.
    InvalidMode,
    /// Handle of no live monitoring region.
    InvalidHandle,
    /// The frame is not hooked.
    NotHooked,
    /// The frame is not hidden.
    NotHidden,
    /// Frame number outside what the EPT can name.
    InvalidFrame,
    /// A table has no physical address.
    Untranslatable,
    /// An entry could not be written.
    Mapping(EptMappingError),
}

impl From<EptMappingError> for EptError {
    fn from(e: EptMappingError) -> Self {
        Self::Mapping(e)
    }
}

/// Cached EPT translations are stale.
#[must_use = "the EPT changed; flush it before resuming the guest"]
#[derive(Debug, PartialEq, Eq)]
pub struct EptFlush(());

impl EptFlush {
    pub(crate) const fn new() -> Self {
        Self(())
    }

    /// Invalidate the cached translations.
    pub fn flush<P: Platform>(self, platform: &P) {
        platform.invalidate_ept();
    }
}

/// Frame every hidden page is redirected to, and the frame writes to hidden
/// pages are diverted into.
#[repr(C, align(4096))]
struct ScrubPage([u8; PAGE_SIZE as usize]);

/// Extended page tables of one logical processor.
pub struct Ept {
    pml4: Box<PageTable<EptPml4e>>,
    pdpt: Box<PageTable<EptPdpe>>,
    pds: Box<[PageTable<EptPde>]>,
    pool: Box<[PageTable<EptPte>]>,
    pool_pfns: Box<[u64]>,
    // 2 MiB region index of each used pool table.
    pool_owner: [usize; EPT_SPLIT_POOL_PAGES],
    pool_used: usize,
    scrub: Box<ScrubPage>,
    scrub_pfn: u64,
    sink: Box<ScrubPage>,
    sink_pfn: u64,
    hooks: [Option<EptHook>; EPT_HOOK_COUNT],
    mmrs: [Option<Mmr>; EPT_MMR_COUNT],
    generation: u32,
    pending_rearm: Option<violation::PendingRearm>,
    eptp: Eptp,
}

fn physical<P: Platform, T>(platform: &P, table: &T) -> Result<Pa, EptError> {
    platform
        .physical_address_of(table as *const T as *const u8)
        .ok_or(EptError::Untranslatable)
}

#[inline]
const fn region(gpa: Gpa) -> usize {
    (gpa.into_u64() / LARGE_PAGE_SIZE) as usize
}

impl Ept {
    /// Build the identity EPT and pre-allocate everything the stealth engine
    /// may need later.
    pub fn new<P: Platform>(platform: &P) -> Result<Self, EptError> {
        let mut pml4 = Box::new(PageTable::filled(EptPml4e::EMPTY));
        let mut pdpt = Box::new(PageTable::filled(EptPdpe::EMPTY));
        let mut pds = vec![PageTable::filled(EptPde::EMPTY); ENTRY_COUNT].into_boxed_slice();

        for (i, pd) in pds.iter_mut().enumerate() {
            for (j, pde) in pd.iter_mut().enumerate() {
                let frame = Pa::new(((i * ENTRY_COUNT + j) as u64) * LARGE_PAGE_SIZE)
                    .ok_or(EptError::OutOfRange)?;
                pde.set_permission(Permission::FULL)
                    .set_memory_type(platform.memory_type(frame))
                    .set_large(true)
                    .set_pa(frame)?;
            }
            pdpt[i]
                .set_permission(Permission::FULL)
                .set_pa(physical(platform, pd)?)?;
        }
        pml4[0]
            .set_permission(Permission::FULL)
            .set_pa(physical(platform, &*pdpt)?)?;

        let pool = vec![PageTable::filled(EptPte::EMPTY); EPT_SPLIT_POOL_PAGES].into_boxed_slice();
        let pool_pfns = pool
            .iter()
            .map(|table| physical(platform, table).map(Pa::pfn))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        let scrub = Box::new(ScrubPage([0; PAGE_SIZE as usize]));
        let scrub_pfn = physical(platform, &*scrub)?.pfn();
        let sink = Box::new(ScrubPage([0; PAGE_SIZE as usize]));
        let sink_pfn = physical(platform, &*sink)?.pfn();
        let eptp = Eptp::new(physical(platform, &*pml4)?)?;

        Ok(Self {
            pml4,
            pdpt,
            pds,
            pool,
            pool_pfns,
            pool_owner: [0; EPT_SPLIT_POOL_PAGES],
            pool_used: 0,
            scrub,
            scrub_pfn,
            sink,
            sink_pfn,
            hooks: [None; EPT_HOOK_COUNT],
            mmrs: [None; EPT_MMR_COUNT],
            generation: 0,
            pending_rearm: None,
            eptp,
        })
    }

    /// Value to load into the EPTP VMCS field.
    pub fn eptp(&self) -> Eptp {
        self.eptp
    }

    /// Pool tables consumed by splits.
    pub fn used_pages(&self) -> usize {
        self.pool_used
    }

    /// Physical address of the scrub page.
    pub fn scrub_pa(&self) -> Option<Pa> {
        Pa::from_pfn(self.scrub_pfn)
    }

    /// Content the guest reads from a hidden page.
    pub fn scrub_page(&self) -> &[u8] {
        &self.scrub.0
    }

    /// Physical address of the sink page.
    pub fn sink_pa(&self) -> Option<Pa> {
        Pa::from_pfn(self.sink_pfn)
    }

    /// Content of the sink page. Zero except while a write to a hidden page
    /// is being single stepped.
    pub fn sink_page(&self) -> &[u8] {
        &self.sink.0
    }

    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn sink_page_mut(&mut self) -> &mut [u8] {
        &mut self.sink.0
    }

    /// Frames owned by the stealth engine itself.
    fn is_reserved(&self, pfn: u64) -> bool {
        pfn == self.scrub_pfn || pfn == self.sink_pfn
    }

    fn pool_slot(&self, region: usize) -> Option<usize> {
        self.pool_owner[..self.pool_used]
            .iter()
            .position(|&r| r == region)
    }

    /// The 4 KiB leaf mapping `gpa`, if its 2 MiB page was split.
    pub fn pte(&self, gpa: Gpa) -> Result<&EptPte, EptError> {
        if !ept_covers(gpa) {
            return Err(EptError::OutOfRange);
        }
        let slot = self.pool_slot(region(gpa)).ok_or(EptError::NotSplit)?;
        Ok(&self.pool[slot][gpa.pt_index()])
    }

    /// The 4 KiB leaf mapping `gpa`; with `split` the 2 MiB page holding it
    /// is split first if needed.
    pub(crate) fn pte_mut(&mut self, gpa: Gpa, split: bool) -> Result<&mut EptPte, EptError> {
        if !ept_covers(gpa) {
            return Err(EptError::OutOfRange);
        }
        let slot = match self.pool_slot(region(gpa)) {
            Some(slot) => slot,
            None if split => self.split(gpa)?,
            None => return Err(EptError::NotSplit),
        };
        Ok(&mut self.pool[slot][gpa.pt_index()])
    }

    /// Replace the 2 MiB leaf holding `gpa` by a 4 KiB table with the same
    /// frames, rights and memory type.
    fn split(&mut self, gpa: Gpa) -> Result<usize, EptError> {
        if self.pool_used == EPT_SPLIT_POOL_PAGES {
            return Err(EptError::PoolExhausted);
        }
        let slot = self.pool_used;
        let pde = &mut self.pds[gpa.pdpt_index()][gpa.pd_index()];
        let base = pde.pfn();
        let perm = pde.permission();
        let ty = pde.memory_type().unwrap_or(MemoryType::WriteBack);

        for (k, pte) in self.pool[slot].iter_mut().enumerate() {
            *pte = EptPte::EMPTY;
            pte.set_permission(perm)
                .set_memory_type(ty)
                .set_pa(Pa::from_pfn(base + k as u64).ok_or(EptError::InvalidFrame)?)?;
        }
        let table = Pa::from_pfn(self.pool_pfns[slot]).ok_or(EptError::InvalidFrame)?;
        *pde = EptPde::EMPTY;
        pde.set_permission(Permission::FULL).set_pa(table)?;

        self.pool_owner[slot] = region(gpa);
        self.pool_used += 1;
        Ok(slot)
    }

    /// Raw leaf entry mapping `gpa`: the 4 KiB entry if split, else the 2 MiB one.
    pub fn leaf(&self, gpa: Gpa) -> Result<u64, EptError> {
        if !ept_covers(gpa) {
            return Err(EptError::OutOfRange);
        }
        let pde = self.pds[gpa.pdpt_index()][gpa.pd_index()];
        if pde.is_large() {
            Ok(pde.0)
        } else {
            self.pte(gpa).map(|pte| pte.0)
        }
    }

    /// Translate `gpa` the way the processor does for an `access`.
    pub fn translate(&self, gpa: Gpa, access: Permission) -> Result<Pa, EptViolation> {
        let fault = |granted| EptViolation {
            gpa,
            access,
            granted,
        };
        if !ept_covers(gpa)
            || self.pml4[0].pa().is_none()
            || self.pdpt[gpa.pdpt_index()].pa().is_none()
        {
            return Err(fault(Permission::empty()));
        }
        let pde = self.pds[gpa.pdpt_index()][gpa.pd_index()];
        let (frame, granted, offset) = if pde.is_large() {
            (pde.pfn(), pde.permission(), gpa.into_u64() & (LARGE_PAGE_SIZE - 1))
        } else {
            let pte = self.pte(gpa).map_err(|_| fault(Permission::empty()))?;
            (pte.pfn(), pte.permission(), gpa.page_offset())
        };
        if !granted.contains(access) || granted.is_empty() {
            return Err(fault(granted));
        }
        Pa::from_pfn(frame)
            .map(|pa| pa + offset)
            .ok_or(fault(granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedPlatform;

    pub(super) fn ept() -> (SimulatedPlatform, Ept) {
        let p = SimulatedPlatform::new(16 << 20);
        let ept = Ept::new(&p).unwrap();
        (p, ept)
    }

    pub(super) fn gpa(pfn: u64) -> Gpa {
        Gpa::from_pfn(pfn).unwrap()
    }

    #[test]
    fn identity_translation() {
        let (_, ept) = ept();
        for addr in [0, 0x1234, 0x20_0000, 0x7fff_ffff_f000, (512 << 30) - 1] {
            let gpa = Gpa::new(addr).unwrap();
            assert_eq!(
                ept.translate(gpa, Permission::FULL),
                Ok(Pa::new(addr).unwrap())
            );
        }
        assert!(ept.translate(Gpa::new(512 << 30).unwrap(), Permission::READ).is_err());
        assert_eq!(ept.used_pages(), 0);
    }

    #[test]
    fn eptp_points_at_pml4() {
        let (p, ept) = ept();
        let pml4 = p.physical_address_of(&*ept.pml4 as *const _ as *const u8).unwrap();
        assert_eq!(ept.eptp().pml4(), pml4.into_u64());
    }

    #[test]
    fn split_preserves_translation() {
        let (_, mut ept) = ept();
        let before: Vec<_> = (0x200..0x400)
            .map(|pfn| ept.translate(gpa(pfn), Permission::FULL))
            .collect();
        let large = ept.leaf(gpa(0x300)).unwrap();

        ept.pte_mut(gpa(0x300), true).unwrap();
        assert_eq!(ept.used_pages(), 1);
        let after: Vec<_> = (0x200..0x400)
            .map(|pfn| ept.translate(gpa(pfn), Permission::FULL))
            .collect();
        assert_eq!(before, after);

        let leaf = EptPte(ept.leaf(gpa(0x300)).unwrap());
        assert_eq!(leaf.permission(), Permission::FULL);
        assert_eq!(leaf.memory_type(), EptPde(large).memory_type());
        assert_eq!(leaf.pfn(), 0x300);

        // Splitting again reuses the table.
        ept.pte_mut(gpa(0x3ff), true).unwrap();
        assert_eq!(ept.used_pages(), 1);
    }

    #[test]
    fn lookup_without_split() {
        let (_, mut ept) = ept();
        assert_eq!(ept.pte_mut(gpa(0x10), false).err(), Some(EptError::NotSplit));
        assert_eq!(ept.pte(gpa(0x10)).err(), Some(EptError::NotSplit));
        assert_eq!(
            ept.pte_mut(Gpa::new(1 << 40).unwrap(), true).err(),
            Some(EptError::OutOfRange)
        );
    }

    #[test]
    fn pool_exhaustion() {
        let (_, mut ept) = ept();
        for i in 0..EPT_SPLIT_POOL_PAGES as u64 {
            ept.pte_mut(gpa(i * 512), true).unwrap();
        }
        assert_eq!(
            ept.pte_mut(gpa(EPT_SPLIT_POOL_PAGES as u64 * 512), true).err(),
            Some(EptError::PoolExhausted)
        );
        // Already split regions keep working.
        assert!(ept.pte_mut(gpa(5), true).is_ok());
    }
}
