//! A machine simulated in memory.
//!
//! [`SimulatedPlatform`] backs physical memory with a byte vector and treats
//! host pointers as their own physical addresses, which is all the table
//! builders need. [`GuestPageTableBuilder`] lays out guest page tables inside
//! that memory.
use crate::{
    ept::Ept,
    platform::{AccessFault, Platform},
};
use abyss::{
    addressing::{Gpa, Pa, Va, PAGE_SIZE},
    ept::Permission,
    paging::{PdeFlags, PdpeFlags, Pml4eFlags, PteFlags},
};
use core::{
    ops::Range,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use spin_lock::SpinLock;
use std::vec::Vec;

/// Physical memory and counters of a simulated machine.
pub struct SimulatedPlatform {
    memory: SpinLock<Vec<u8>>,
    invalidations: AtomicUsize,
    clock: AtomicU64,
}

impl SimulatedPlatform {
    /// A machine with `size` bytes of zeroed physical memory.
    pub fn new(size: usize) -> Self {
        Self {
            memory: SpinLock::new(std::vec![0; size]),
            invalidations: AtomicUsize::new(0),
            clock: AtomicU64::new(1),
        }
    }

    /// Bytes of physical memory.
    pub fn size(&self) -> u64 {
        self.memory.lock().len() as u64
    }

    /// EPT invalidations so far.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    fn range(&self, pa: Pa, len: usize, size: usize) -> Result<Range<usize>, AccessFault> {
        let start = pa.into_u64() as usize;
        start
            .checked_add(len)
            .filter(|end| *end <= size)
            .map(|end| start..end)
            .ok_or(AccessFault::NotBacked(pa))
    }
}

impl Platform for SimulatedPlatform {
    fn read_physical(&self, pa: Pa, buf: &mut [u8]) -> Result<(), AccessFault> {
        let memory = self.memory.lock();
        let range = self.range(pa, buf.len(), memory.len())?;
        buf.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn write_physical(&self, pa: Pa, buf: &[u8]) -> Result<(), AccessFault> {
        let mut memory = self.memory.lock();
        let range = self.range(pa, buf.len(), memory.len())?;
        memory[range].copy_from_slice(buf);
        Ok(())
    }

    fn physical_address_of(&self, va: *const u8) -> Option<Pa> {
        Pa::new(va as u64)
    }

    fn invalidate_ept(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }
}

/// Builds 4-level guest page tables in simulated physical memory.
pub struct GuestPageTableBuilder<'a> {
    platform: &'a SimulatedPlatform,
    frames: Range<u64>,
    pml4: Pa,
}

impl<'a> GuestPageTableBuilder<'a> {
    /// Start an address space whose tables take frames out of `frames`.
    pub fn new(platform: &'a SimulatedPlatform, frames: Range<u64>) -> Self {
        let mut builder = Self {
            platform,
            frames,
            pml4: Pa::ZERO,
        };
        builder.pml4 = builder.alloc();
        builder
    }

    /// CR3 of the address space.
    pub fn cr3(&self) -> u64 {
        self.pml4.into_u64()
    }

    fn alloc(&mut self) -> Pa {
        let pfn = self.frames.next().expect("out of page table frames");
        let pa = Pa::from_pfn(pfn).expect("bad frame");
        self.platform
            .write_physical(pa, &[0; PAGE_SIZE as usize])
            .expect("frame outside memory");
        pa
    }

    fn write(&self, table: Pa, index: usize, value: u64) {
        self.platform
            .write_physical(table + index as u64 * 8, &value.to_le_bytes())
            .expect("table outside memory");
    }

    fn next_table(&mut self, table: Pa, index: usize, flags: u64) -> Pa {
        let e = self
            .platform
            .read_u64(table + index as u64 * 8)
            .expect("table outside memory");
        if e & Pml4eFlags::P.bits() != 0 {
            return Pa::new(e & 0x000f_ffff_ffff_f000).expect("bad entry");
        }
        let next = self.alloc();
        self.write(table, index, next.into_u64() | flags);
        next
    }

    fn walk_to(&mut self, gva: u64, depth: usize) -> (Pa, Va) {
        let va = Va::new(gva).expect("non canonical address");
        let inner = (Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US).bits();
        let indices = [va.pml4_index(), va.pdpt_index(), va.pd_index()];
        let mut table = self.pml4;
        for index in &indices[..depth] {
            table = self.next_table(table, *index, inner);
        }
        (table, va)
    }

    /// Map the 4 KiB page at `gva` to `pa`.
    pub fn map_page(&mut self, gva: u64, pa: Pa) {
        let (pt, va) = self.walk_to(gva, 3);
        let flags = (PteFlags::P | PteFlags::RW | PteFlags::US).bits();
        self.write(pt, va.pt_index(), pa.into_u64() | flags);
    }

    /// Map the 2 MiB page at `gva` to `pa`.
    pub fn map_large(&mut self, gva: u64, pa: Pa) {
        let (pd, va) = self.walk_to(gva, 2);
        let flags = (PdeFlags::P | PdeFlags::RW | PdeFlags::US | PdeFlags::PS).bits();
        self.write(pd, va.pd_index(), pa.into_u64() | flags);
    }

    /// Map the 1 GiB page at `gva` to `pa`.
    pub fn map_huge(&mut self, gva: u64, pa: Pa) {
        let (pdpt, va) = self.walk_to(gva, 1);
        let flags = (PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US | PdpeFlags::PS).bits();
        self.write(pdpt, va.pdpt_index(), pa.into_u64() | flags);
    }
}

/// Read `buf.len()` bytes at `gpa` the way the guest sees them through `ept`.
///
/// Returns the violation if the EPT refuses `access`.
pub fn guest_read(
    ept: &Ept,
    platform: &SimulatedPlatform,
    gpa: Gpa,
    access: Permission,
    buf: &mut [u8],
) -> Result<(), crate::ept::EptViolation> {
    let pa = ept.translate(gpa, access)?;
    let offset = pa.page_offset() as usize;
    if Some(pa.page_down()) == ept.scrub_pa() {
        buf.copy_from_slice(&ept.scrub_page()[offset..offset + buf.len()]);
    } else if Some(pa.page_down()) == ept.sink_pa() {
        buf.copy_from_slice(&ept.sink_page()[offset..offset + buf.len()]);
    } else {
        platform.read_physical(pa, buf).expect("guest frame outside memory");
    }
    Ok(())
}

/// Write `buf` at `gpa` the way the guest would through `ept`.
///
/// Returns the violation if the EPT refuses the write.
pub fn guest_write(
    ept: &mut Ept,
    platform: &SimulatedPlatform,
    gpa: Gpa,
    buf: &[u8],
) -> Result<(), crate::ept::EptViolation> {
    let pa = ept.translate(gpa, Permission::WRITE)?;
    let offset = pa.page_offset() as usize;
    assert_ne!(Some(pa.page_down()), ept.scrub_pa(), "scrub page is writable");
    if Some(pa.page_down()) == ept.sink_pa() {
        ept.sink_page_mut()[offset..offset + buf.len()].copy_from_slice(buf);
    } else {
        platform.write_physical(pa, buf).expect("guest frame outside memory");
    }
    Ok(())
}
