//! EPT violations raised by the stealth engine.
//!
//! Two kinds of violation are expected:
//!
//! - On a hooked frame, the leaf shows the wrong view for the access. The
//!   handler flips the view and the guest retries.
//! - On a monitored frame, the access is watched. The handler grants the
//!   original rights on that one page and asks for a single step. Once the
//!   instruction retired, the monitor trap flag exit calls
//!   [`Ept::complete_single_step`], which takes the rights away again.
//! - On a hidden frame, the guest wrote. The handler lets the write land in
//!   the sink page for one instruction, and completing the single step wipes
//!   it again.
use super::{Ept, EptError, EptFlush, Mmr, MmrHandle};
use abyss::{
    addressing::Gpa,
    ept::{Permission, ViolationQualification},
};

/// An access the EPT did not allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptViolation {
    /// Faulting guest physical address.
    pub gpa: Gpa,
    /// Access attempted.
    pub access: Permission,
    /// Rights the leaf granted.
    pub granted: Permission,
}

impl EptViolation {
    /// Decode a violation from its exit qualification.
    pub fn from_exit(gpa: Gpa, qualification: ViolationQualification) -> Self {
        Self {
            gpa,
            access: qualification.access(),
            granted: qualification.granted(),
        }
    }
}

/// A page whose rights are open until the next single step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PendingRearm {
    /// A page of the monitoring region `handle`.
    Mmr { handle: MmrHandle, page: Gpa },
    /// A hidden page mapped to the sink page. `hidden` are its rights while
    /// it points at the scrub page.
    HiddenWrite { page: Gpa, hidden: Permission },
}

/// What the handler did about a violation.
#[derive(Debug, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// A hooked leaf now shows the view the access needs.
    HookViewSwitched(EptFlush),
    /// A monitored page is open for one instruction. The guest must single
    /// step and then call [`Ept::complete_single_step`].
    SingleStep {
        /// Region the access hit.
        mmr: Mmr,
        /// Pending invalidation.
        flush: EptFlush,
    },
    /// A write to a hidden page goes to the sink page for one instruction.
    /// The guest must single step and then call
    /// [`Ept::complete_single_step`].
    HiddenWriteDiverted(EptFlush),
    /// Not caused by the stealth engine.
    Unhandled,
}

impl Ept {
    /// Resolve a violation caused by a hook, a hidden page or a monitoring
    /// region.
    pub fn handle_violation(
        &mut self,
        violation: &EptViolation,
    ) -> Result<ViolationOutcome, EptError> {
        let pfn = violation.gpa.pfn();
        if let Some(hook) = self.hook(pfn).copied() {
            return self
                .switch_hook_view(hook, violation.access)
                .map(ViolationOutcome::HookViewSwitched);
        }

        let page = violation.gpa.page_down();
        if self.is_hidden(pfn) && violation.access.contains(Permission::WRITE) {
            if let Some(pending) = self.pending_rearm.take() {
                self.rearm(pending)?;
            }
            let hidden = self.open_sink(page)?;
            self.pending_rearm = Some(PendingRearm::HiddenWrite { page, hidden });
            return Ok(ViolationOutcome::HiddenWriteDiverted(EptFlush::new()));
        }

        let mmr = match self.mmr_covering(violation.gpa) {
            Some(mmr) => *mmr,
            None => return Ok(ViolationOutcome::Unhandled),
        };
        // A step that never completed leaves its page open; close it first.
        if let Some(pending) = self.pending_rearm.take() {
            self.rearm(pending)?;
        }
        self.pte_mut(page, false)?.set_permission(mmr.original());
        self.pending_rearm = Some(PendingRearm::Mmr {
            handle: mmr.handle(),
            page,
        });
        Ok(ViolationOutcome::SingleStep {
            mmr,
            flush: EptFlush::new(),
        })
    }

    /// Close the page a previous [`ViolationOutcome::SingleStep`] or
    /// [`ViolationOutcome::HiddenWriteDiverted`] opened.
    ///
    /// Returns `None` if nothing was pending, or if the region was removed
    /// meanwhile.
    pub fn complete_single_step(&mut self) -> Result<Option<EptFlush>, EptError> {
        match self.pending_rearm.take() {
            Some(pending) => self.rearm(pending),
            None => Ok(None),
        }
    }

    /// Whether an open page waits for its single step.
    pub fn single_step_pending(&self) -> bool {
        self.pending_rearm.is_some()
    }

    fn rearm(&mut self, pending: PendingRearm) -> Result<Option<EptFlush>, EptError> {
        match pending {
            PendingRearm::Mmr { handle, page } => {
                let watched = match self.mmr(handle) {
                    Some(mmr) => mmr.watched(),
                    None => return Ok(None),
                };
                self.pte_mut(page, false)?.set_permission(watched);
            }
            PendingRearm::HiddenWrite { page, hidden } => self.close_sink(page, hidden)?,
        }
        Ok(Some(EptFlush::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ept, gpa};
    use super::*;
    use abyss::addressing::Pa;
    use frog_abi::MmrMode;

    fn fault(ept: &Ept, gpa: Gpa, access: Permission) -> EptViolation {
        ept.translate(gpa, access).unwrap_err()
    }

    #[test]
    fn decode_qualification() {
        let q = ViolationQualification::WRITE
            | ViolationQualification::READABLE
            | ViolationQualification::EXECUTABLE;
        let v = EptViolation::from_exit(gpa(3), q);
        assert_eq!(v.access, Permission::WRITE);
        assert_eq!(v.granted, Permission::READ | Permission::EXECUTE);
    }

    #[test]
    fn hook_views_alternate() {
        let (_, mut ept) = ept();
        let _ = ept.install_hook(0x100, 0x200).unwrap();

        let v = fault(&ept, gpa(0x100) + 8, Permission::READ);
        assert!(matches!(ept.handle_violation(&v), Ok(ViolationOutcome::HookViewSwitched(_))));
        assert_eq!(
            ept.translate(gpa(0x100) + 8, Permission::READ | Permission::WRITE),
            Ok(Pa::from_pfn(0x100).unwrap() + 8)
        );
        assert!(ept.translate(gpa(0x100), Permission::EXECUTE).is_err());

        let v = fault(&ept, gpa(0x100), Permission::EXECUTE);
        assert!(matches!(ept.handle_violation(&v), Ok(ViolationOutcome::HookViewSwitched(_))));
        assert_eq!(
            ept.translate(gpa(0x100), Permission::EXECUTE),
            Ok(Pa::from_pfn(0x200).unwrap())
        );
    }

    #[test]
    fn mmr_single_step() {
        let (_, mut ept) = ept();
        let (h, _) = ept.install_mmr(gpa(0x30), 0x2000, MmrMode::W).unwrap();

        let v = fault(&ept, gpa(0x31) + 0x10, Permission::WRITE);
        match ept.handle_violation(&v).unwrap() {
            ViolationOutcome::SingleStep { mmr, .. } => assert_eq!(mmr.handle(), h),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ept.single_step_pending());
        assert!(ept.translate(gpa(0x31), Permission::WRITE).is_ok());
        // Only the faulting page is open.
        assert!(ept.translate(gpa(0x30), Permission::WRITE).is_err());

        assert!(ept.complete_single_step().unwrap().is_some());
        assert!(!ept.single_step_pending());
        assert!(ept.translate(gpa(0x31), Permission::WRITE).is_err());
        assert!(ept.translate(gpa(0x31), Permission::READ).is_ok());
        assert_eq!(ept.complete_single_step(), Ok(None));
    }

    #[test]
    fn read_watch_reports_writes() {
        let (_, mut ept) = ept();
        let (h, _) = ept.install_mmr(gpa(0x30), 0x1000, MmrMode::R).unwrap();
        let v = fault(&ept, gpa(0x30), Permission::WRITE);
        assert_eq!(v.access, Permission::WRITE);
        match ept.handle_violation(&v).unwrap() {
            ViolationOutcome::SingleStep { mmr, .. } => {
                assert_eq!(mmr.handle(), h);
                assert_eq!(mmr.mode, MmrMode::R);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hidden_write_closes_stale_step() {
        let (_, mut ept) = ept();
        let _ = ept.install_mmr(gpa(0x30), 0x1000, MmrMode::W).unwrap();
        let _ = ept.hide_page(0x40).unwrap();
        let v = fault(&ept, gpa(0x30), Permission::WRITE);
        let _ = ept.handle_violation(&v).unwrap();

        let v = fault(&ept, gpa(0x40), Permission::WRITE);
        assert!(matches!(
            ept.handle_violation(&v),
            Ok(ViolationOutcome::HiddenWriteDiverted(_))
        ));
        assert!(ept.translate(gpa(0x30), Permission::WRITE).is_err());
        assert_eq!(ept.translate(gpa(0x40), Permission::WRITE).ok(), ept.sink_pa());

        assert!(ept.complete_single_step().unwrap().is_some());
        assert_eq!(ept.translate(gpa(0x40), Permission::READ).ok(), ept.scrub_pa());
        assert!(ept.translate(gpa(0x40), Permission::WRITE).is_err());
    }

    #[test]
    fn stale_step_is_closed_by_next_violation() {
        let (_, mut ept) = ept();
        let _ = ept.install_mmr(gpa(0x30), 0x2000, MmrMode::R).unwrap();
        let v = fault(&ept, gpa(0x30), Permission::READ);
        let _ = ept.handle_violation(&v).unwrap();
        let v = fault(&ept, gpa(0x31), Permission::READ);
        let _ = ept.handle_violation(&v).unwrap();
        assert!(ept.translate(gpa(0x30), Permission::READ).is_err());
        assert!(ept.translate(gpa(0x31), Permission::READ).is_ok());
    }

    #[test]
    fn removal_drops_pending_step() {
        let (_, mut ept) = ept();
        let (h, _) = ept.install_mmr(gpa(0x30), 0x1000, MmrMode::X).unwrap();
        let v = fault(&ept, gpa(0x30), Permission::EXECUTE);
        let _ = ept.handle_violation(&v).unwrap();
        let _ = ept.remove_mmr(h).unwrap();
        assert_eq!(ept.complete_single_step(), Ok(None));
        assert_eq!(ept.pte(gpa(0x30)).unwrap().permission(), Permission::FULL);
    }

    #[test]
    fn unrelated_violation() {
        let (_, mut ept) = ept();
        let v = EptViolation {
            gpa: gpa(0x55),
            access: Permission::READ,
            granted: Permission::empty(),
        };
        assert_eq!(ept.handle_violation(&v), Ok(ViolationOutcome::Unhandled));
    }
}
