//! Memory monitoring regions.
//!
//! A region removes the rights named by its mode from every leaf covering it.
//! A matching access then exits with an EPT violation; see [`violation`] for
//! what happens next.
//!
//! Write without read is an EPT misconfiguration, so watching reads also
//! takes away writes. A region watching only reads therefore reports writes
//! as well; the logged access tells them apart.
//!
//! [`violation`]: super::violation
use super::{violation::PendingRearm, Ept, EptError, EptFlush};
use crate::config::ept_covers;
use abyss::{addressing::Gpa, ept::Permission};
use frog_abi::MmrMode;

/// Opaque name of a live region.
///
/// Carries the slot and the install generation, so a handle of a removed
/// region never names a later region reusing the slot. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MmrHandle(u64);

impl MmrHandle {
    /// Rebuild a handle a client got back from `install_mmr`.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value handed to clients.
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    fn new(generation: u32, slot: usize) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 + 1))
    }

    fn slot(self) -> Option<usize> {
        ((self.0 & 0xffff_ffff) as usize).checked_sub(1)
    }
}

/// One monitoring region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mmr {
    /// First byte watched.
    pub start: Gpa,
    /// Bytes watched.
    pub size: u64,
    /// Accesses watched.
    pub mode: MmrMode,
    first: Gpa,
    last: Gpa,
    original: Permission,
    watched: Permission,
    handle: MmrHandle,
}

impl Mmr {
    /// Handle of this region.
    pub fn handle(&self) -> MmrHandle {
        self.handle
    }

    /// Rights of the covered leaves before the region was installed.
    pub fn original(&self) -> Permission {
        self.original
    }

    /// Rights of the covered leaves while the region is armed.
    pub fn watched(&self) -> Permission {
        self.watched
    }

    /// Whether the page holding `gpa` is covered.
    pub fn covers(&self, gpa: Gpa) -> bool {
        let page = gpa.page_down();
        self.first <= page && page <= self.last
    }

    fn overlaps(&self, first: Gpa, last: Gpa) -> bool {
        self.first <= last && first <= self.last
    }

    /// Pages covered by this region.
    pub fn pages(&self) -> impl Iterator<Item = Gpa> {
        pages(self.first, self.last)
    }
}

fn pages(first: Gpa, last: Gpa) -> impl Iterator<Item = Gpa> {
    (first.pfn()..=last.pfn()).filter_map(Gpa::from_pfn)
}

impl Ept {
    /// Watch `size` bytes from `start` for the accesses in `mode`.
    ///
    /// Every covered leaf must currently grant the same rights; the region
    /// restores exactly those on removal.
    pub fn install_mmr(
        &mut self,
        start: Gpa,
        size: u64,
        mode: MmrMode,
    ) -> Result<(MmrHandle, EptFlush), EptError> {
        if mode.is_empty() {
            return Err(EptError::InvalidMode);
        }
        let end = size
            .checked_sub(1)
            .and_then(|len| start.into_u64().checked_add(len))
            .and_then(Gpa::new)
            .filter(|gpa| ept_covers(*gpa))
            .ok_or(EptError::InvalidRange)?;
        if !ept_covers(start) {
            return Err(EptError::InvalidRange);
        }
        let (first, last) = (start.page_down(), end.page_down());

        if self.mmrs.iter().flatten().any(|m| m.overlaps(first, last)) {
            return Err(EptError::Conflict);
        }
        let slot = self
            .mmrs
            .iter()
            .position(Option::is_none)
            .ok_or(EptError::MmrTableFull)?;

        // Split and check everything before touching any right.
        let mut original = None;
        for page in pages(first, last) {
            if self.hook(page.pfn()).is_some() || self.is_hidden(page.pfn()) {
                return Err(EptError::Conflict);
            }
            let perm = self.pte_mut(page, true)?.permission();
            match original {
                None => original = Some(perm),
                Some(p) if p != perm => return Err(EptError::Conflict),
                Some(_) => (),
            }
        }
        let original = original.ok_or(EptError::InvalidRange)?;
        let mut watched = original - Permission::from_bits_truncate(mode.bits() as u64);
        if !watched.contains(Permission::READ) {
            watched.remove(Permission::WRITE);
        }

        for page in pages(first, last) {
            self.pte_mut(page, false)?.set_permission(watched);
        }

        self.generation = self.generation.wrapping_add(1);
        let handle = MmrHandle::new(self.generation, slot);
        self.mmrs[slot] = Some(Mmr {
            start,
            size,
            mode,
            first,
            last,
            original,
            watched,
            handle,
        });
        Ok((handle, EptFlush::new()))
    }

    /// Stop watching the region named by `handle`.
    pub fn remove_mmr(&mut self, handle: MmrHandle) -> Result<EptFlush, EptError> {
        let slot = handle
            .slot()
            .filter(|&slot| matches!(self.mmrs.get(slot), Some(Some(m)) if m.handle == handle))
            .ok_or(EptError::InvalidHandle)?;
        let mmr = self.mmrs[slot].take().ok_or(EptError::InvalidHandle)?;
        self.restore(&mmr)?;
        Ok(EptFlush::new())
    }

    /// Stop watching every region. Returns how many were live.
    pub fn remove_all_mmrs(&mut self) -> Result<(usize, EptFlush), EptError> {
        let mut removed = 0;
        for slot in 0..self.mmrs.len() {
            if let Some(mmr) = self.mmrs[slot].take() {
                self.restore(&mmr)?;
                removed += 1;
            }
        }
        Ok((removed, EptFlush::new()))
    }

    fn restore(&mut self, mmr: &Mmr) -> Result<(), EptError> {
        if let Some(PendingRearm::Mmr { handle, .. }) = self.pending_rearm {
            if handle == mmr.handle {
                self.pending_rearm = None;
            }
        }
        for page in mmr.pages() {
            self.pte_mut(page, false)?.set_permission(mmr.original);
        }
        Ok(())
    }

    /// The live region named by `handle`.
    pub fn mmr(&self, handle: MmrHandle) -> Option<&Mmr> {
        self.mmrs
            .get(handle.slot()?)?
            .as_ref()
            .filter(|m| m.handle == handle)
    }

    /// The live region covering `gpa`.
    pub fn mmr_covering(&self, gpa: Gpa) -> Option<&Mmr> {
        self.mmrs.iter().flatten().find(|m| m.covers(gpa))
    }

    /// Every live region.
    pub fn mmrs(&self) -> impl Iterator<Item = &Mmr> + '_ {
        self.mmrs.iter().flatten()
    }
}
