//! Hidden pages.
//!
//! Hiding a frame points its leaf at the scrub page of this EPT and takes
//! away its write right. Memory type is untouched, so the guest notices no
//! change in caching; it just reads zeros.
//!
//! The scrub page is shared by every hidden frame, so it must never be
//! written. A write to a hidden frame exits with an EPT violation instead.
//! The handler points the leaf at the sink page with write allowed and asks
//! for a single step; completing the step wipes the sink page and maps the
//! scrub page again. The real frame never sees the write and no other hidden
//! frame reads it back.
//!
//! A hidden leaf whose frame was writable remembers that in
//! [`SOFTWARE_AVAILABLE`], so unhiding restores the leaf exactly.
use super::{violation::PendingRearm, Ept, EptError, EptFlush};
use crate::config::ept_covers;
use abyss::{
    addressing::{Gpa, Pa},
    ept::{EptPte, Permission, SOFTWARE_AVAILABLE},
};

const WAS_WRITABLE: u64 = SOFTWARE_AVAILABLE;

impl Ept {
    /// Redirect guest accesses of `pfn` to the scrub page.
    ///
    /// Hiding a hidden frame again changes nothing.
    pub fn hide_page(&mut self, pfn: u64) -> Result<EptFlush, EptError> {
        let gpa = Gpa::from_pfn(pfn)
            .filter(|gpa| ept_covers(*gpa))
            .ok_or(EptError::InvalidFrame)?;
        if self.is_reserved(pfn) {
            return Err(EptError::InvalidFrame);
        }
        if self.hook(pfn).is_some() || self.mmr_covering(gpa).is_some() {
            return Err(EptError::Conflict);
        }
        if self.is_hidden(pfn) {
            return Ok(EptFlush::new());
        }
        let scrub = Pa::from_pfn(self.scrub_pfn).ok_or(EptError::InvalidFrame)?;
        let pte = self.pte_mut(gpa, true)?;
        let perm = pte.permission();
        if perm.contains(Permission::WRITE) {
            pte.0 |= WAS_WRITABLE;
        }
        pte.set_permission(perm - Permission::WRITE).set_pa(scrub)?;
        Ok(EptFlush::new())
    }

    /// Map `pfn` to itself again.
    pub fn unhide_page(&mut self, pfn: u64) -> Result<EptFlush, EptError> {
        let gpa = Gpa::from_pfn(pfn)
            .filter(|gpa| ept_covers(*gpa))
            .ok_or(EptError::InvalidFrame)?;
        if !self.is_hidden(pfn) {
            return Err(EptError::NotHidden);
        }
        if let Some(PendingRearm::HiddenWrite { page, hidden }) = self.pending_rearm {
            if page == gpa {
                self.pending_rearm = None;
                self.close_sink(page, hidden)?;
            }
        }
        let frame = Pa::from_pfn(pfn).ok_or(EptError::InvalidFrame)?;
        let pte = self.pte_mut(gpa, false)?;
        let mut perm = pte.permission() - Permission::WRITE;
        if pte.0 & WAS_WRITABLE != 0 {
            perm |= Permission::WRITE;
        }
        pte.0 &= !WAS_WRITABLE;
        pte.set_permission(perm).set_pa(frame)?;
        Ok(EptFlush::new())
    }

    /// Whether `pfn` is hidden.
    pub fn is_hidden(&self, pfn: u64) -> bool {
        !self.is_reserved(pfn)
            && Gpa::from_pfn(pfn)
                .and_then(|gpa| self.pte(gpa).ok())
                .map_or(false, |pte| self.points_at_scrub(pte))
    }

    /// Every hidden frame.
    pub fn hidden_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.pool_owner[..self.pool_used]
            .iter()
            .zip(self.pool.iter())
            .flat_map(move |(&region, table)| {
                table
                    .iter()
                    .enumerate()
                    .filter(move |(_, pte)| self.points_at_scrub(pte))
                    .map(move |(k, _)| region as u64 * 512 + k as u64)
            })
            .filter(move |&pfn| !self.is_reserved(pfn))
    }

    // A hidden leaf points at the sink page while its write is stepped.
    fn points_at_scrub(&self, pte: &EptPte) -> bool {
        pte.pfn() == self.scrub_pfn || pte.pfn() == self.sink_pfn
    }

    /// Divert the write that faulted on the hidden page `page` into the sink
    /// page for one instruction. Returns the rights of the hidden leaf.
    pub(super) fn open_sink(&mut self, page: Gpa) -> Result<Permission, EptError> {
        let sink = Pa::from_pfn(self.sink_pfn).ok_or(EptError::InvalidFrame)?;
        let pte = self.pte_mut(page, false)?;
        let hidden = pte.permission();
        pte.set_permission(hidden | Permission::READ | Permission::WRITE).set_pa(sink)?;
        Ok(hidden)
    }

    /// Drop whatever the stepped instruction wrote and hide `page` again.
    pub(super) fn close_sink(&mut self, page: Gpa, hidden: Permission) -> Result<(), EptError> {
        self.sink.0.fill(0);
        let scrub = Pa::from_pfn(self.scrub_pfn).ok_or(EptError::InvalidFrame)?;
        self.pte_mut(page, false)?.set_permission(hidden).set_pa(scrub)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ept, gpa};
    use super::super::ViolationOutcome;
    use super::*;
    use crate::{
        platform::Platform,
        testing::{guest_read, guest_write},
    };
    use frog_abi::MmrMode;

    #[test]
    fn hidden_reads_scrub() {
        let (p, mut ept) = ept();
        p.write_physical(Pa::from_pfn(0x123).unwrap(), b"secret").unwrap();

        let _ = ept.hide_page(0x123).unwrap();
        assert!(ept.is_hidden(0x123));
        let seen = ept.translate(gpa(0x123) + 0x10, Permission::READ).unwrap();
        assert_eq!(Some(seen.page_down()), ept.scrub_pa());
        assert_eq!(seen.page_offset(), 0x10);
        assert!(ept.scrub_page().iter().all(|&b| b == 0));
        assert_eq!(ept.hidden_pages().collect::<Vec<_>>(), vec![0x123]);

        // Idempotent.
        let _ = ept.hide_page(0x123).unwrap();
        assert_eq!(ept.hidden_pages().count(), 1);
    }

    #[test]
    fn hide_then_unhide_restores_leaf() {
        let (_, mut ept) = ept();
        let _ = ept.pte_mut(gpa(0x77), true).unwrap();
        let before = ept.leaf(gpa(0x77)).unwrap();
        let _ = ept.hide_page(0x77).unwrap();
        assert_ne!(ept.leaf(gpa(0x77)).unwrap(), before);
        let _ = ept.unhide_page(0x77).unwrap();
        assert_eq!(ept.leaf(gpa(0x77)).unwrap(), before);
        assert!(!ept.is_hidden(0x77));
        assert_eq!(ept.unhide_page(0x77).err(), Some(EptError::NotHidden));
    }

    #[test]
    fn hidden_leaf_is_read_only() {
        let (_, mut ept) = ept();
        let _ = ept.hide_page(0x123).unwrap();
        let leaf = ept.pte(gpa(0x123)).unwrap();
        assert_eq!(leaf.permission(), Permission::READ | Permission::EXECUTE);
        assert_ne!(leaf.0 & WAS_WRITABLE, 0);
        assert!(ept.translate(gpa(0x123), Permission::WRITE).is_err());
    }

    #[test]
    fn writes_never_reach_other_hidden_pages() {
        let (p, mut ept) = ept();
        p.write_physical(Pa::from_pfn(0x123).unwrap(), b"secret").unwrap();
        let _ = ept.hide_page(0x123).unwrap();
        let _ = ept.hide_page(0x456).unwrap();

        let v = guest_write(&mut ept, &p, gpa(0x123) + 8, b"leak").unwrap_err();
        assert!(matches!(
            ept.handle_violation(&v),
            Ok(ViolationOutcome::HiddenWriteDiverted(_))
        ));
        assert!(ept.single_step_pending());
        guest_write(&mut ept, &p, gpa(0x123) + 8, b"leak").unwrap();
        let mut seen = [0xffu8; 4];
        guest_read(&ept, &p, gpa(0x456) + 8, Permission::READ, &mut seen).unwrap();
        assert_eq!(seen, [0; 4]);

        assert!(ept.complete_single_step().unwrap().is_some());
        assert!(ept.sink_page().iter().all(|&b| b == 0));
        assert!(ept.scrub_page().iter().all(|&b| b == 0));
        for pfn in [0x123, 0x456] {
            let mut seen = [0xffu8; 4];
            guest_read(&ept, &p, gpa(pfn) + 8, Permission::READ, &mut seen).unwrap();
            assert_eq!(seen, [0; 4]);
        }
        assert!(ept.translate(gpa(0x123), Permission::WRITE).is_err());
        assert_eq!(ept.hidden_pages().collect::<Vec<_>>(), vec![0x123, 0x456]);

        let mut real = [0u8; 6];
        p.read_physical(Pa::from_pfn(0x123).unwrap(), &mut real).unwrap();
        assert_eq!(&real, b"secret");
    }

    #[test]
    fn unhide_during_diverted_write() {
        let (_, mut ept) = ept();
        let _ = ept.pte_mut(gpa(0x77), true).unwrap();
        let before = ept.leaf(gpa(0x77)).unwrap();
        let _ = ept.hide_page(0x77).unwrap();
        let v = ept.translate(gpa(0x77), Permission::WRITE).unwrap_err();
        let _ = ept.handle_violation(&v).unwrap();
        assert!(ept.is_hidden(0x77));

        let _ = ept.unhide_page(0x77).unwrap();
        assert_eq!(ept.leaf(gpa(0x77)).unwrap(), before);
        assert!(!ept.single_step_pending());
        assert_eq!(ept.complete_single_step(), Ok(None));
    }

    #[test]
    fn hidden_frame_cannot_be_monitored() {
        let (_, mut ept) = ept();
        let _ = ept.hide_page(0x60).unwrap();
        assert_eq!(
            ept.install_mmr(gpa(0x5f), 0x2000, MmrMode::W).err(),
            Some(EptError::Conflict)
        );
        let _ = ept.install_mmr(gpa(0x70), 0x1000, MmrMode::X).unwrap();
        assert_eq!(ept.hide_page(0x70).err(), Some(EptError::Conflict));
    }

    #[test]
    fn unhide_never_split() {
        let (_, mut ept) = ept();
        assert_eq!(ept.unhide_page(0x5000).err(), Some(EptError::NotHidden));
        assert_eq!(ept.used_pages(), 0);
    }

    #[test]
    fn hooked_frame_cannot_be_hidden() {
        let (_, mut ept) = ept();
        let _ = ept.install_hook(0x100, 0x200).unwrap();
        assert_eq!(ept.hide_page(0x100).err(), Some(EptError::Conflict));
        let _ = ept.hide_page(0x101).unwrap();
        assert_eq!(ept.install_hook(0x101, 0x200).err(), Some(EptError::Conflict));
    }
}
