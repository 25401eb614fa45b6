//! Execute hooks.
//!
//! A hooked frame has two views. Instruction fetches see the shadow frame;
//! data reads and writes see the original. The leaf starts in the execute view
//! (shadow frame, execute only) and the EPT violation handler flips it to the
//! data view and back as the guest alternates between fetching and touching
//! data on that frame.
//!
//! Hooks live in the EPT of one processor. Hooking a frame machine-wide means
//! installing the same hook on every processor.
use super::{Ept, EptError, EptFlush};
use crate::config::{ept_covers, EPT_COVERAGE};
use abyss::{
    addressing::{Gpa, Pa},
    ept::{EptPte, Permission},
};

/// One installed hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptHook {
    /// Frame whose execution is redirected.
    pub orig_pfn: u64,
    /// Frame that instruction fetches see instead.
    pub exec_pfn: u64,
    saved: EptPte,
}

impl EptHook {
    /// Leaf as it was before the hook.
    pub fn saved(&self) -> EptPte {
        self.saved
    }
}

impl Ept {
    /// Hook `orig_pfn` so that instruction fetches see `exec_pfn`.
    pub fn install_hook(&mut self, orig_pfn: u64, exec_pfn: u64) -> Result<EptFlush, EptError> {
        let orig = Gpa::from_pfn(orig_pfn)
            .filter(|gpa| ept_covers(*gpa))
            .ok_or(EptError::InvalidFrame)?;
        let exec = Pa::from_pfn(exec_pfn)
            .filter(|pa| pa.into_u64() < EPT_COVERAGE)
            .ok_or(EptError::InvalidFrame)?;
        if self.is_reserved(orig_pfn) || self.is_reserved(exec_pfn) {
            return Err(EptError::InvalidFrame);
        }
        if self.hook(orig_pfn).is_some() {
            return Err(EptError::Duplicated);
        }
        if self.is_hidden(orig_pfn) || self.mmr_covering(orig).is_some() {
            return Err(EptError::Conflict);
        }
        let slot = self
            .hooks
            .iter()
            .position(Option::is_none)
            .ok_or(EptError::HookTableFull)?;

        let pte = self.pte_mut(orig, true)?;
        let saved = *pte;
        pte.set_pa(exec)?.set_permission(Permission::EXECUTE);
        self.hooks[slot] = Some(EptHook {
            orig_pfn,
            exec_pfn,
            saved,
        });
        Ok(EptFlush::new())
    }

    /// Remove the hook on `orig_pfn` and restore the leaf exactly as it was.
    ///
    /// Nothing changes if the frame is not hooked.
    pub fn remove_hook(&mut self, orig_pfn: u64) -> Result<EptFlush, EptError> {
        let slot = self
            .hooks
            .iter()
            .position(|h| matches!(h, Some(h) if h.orig_pfn == orig_pfn))
            .ok_or(EptError::NotHooked)?;
        let hook = self.hooks[slot].take().ok_or(EptError::NotHooked)?;
        let orig = Gpa::from_pfn(orig_pfn).ok_or(EptError::InvalidFrame)?;
        *self.pte_mut(orig, false)? = hook.saved;
        Ok(EptFlush::new())
    }

    /// The hook on `orig_pfn`.
    pub fn hook(&self, orig_pfn: u64) -> Option<&EptHook> {
        self.hooks.iter().flatten().find(|h| h.orig_pfn == orig_pfn)
    }

    /// Every live hook.
    pub fn hooks(&self) -> impl Iterator<Item = &EptHook> + '_ {
        self.hooks.iter().flatten()
    }

    /// Point the hooked leaf of `hook` at the view `access` needs.
    pub(super) fn switch_hook_view(
        &mut self,
        hook: EptHook,
        access: Permission,
    ) -> Result<EptFlush, EptError> {
        let orig = Gpa::from_pfn(hook.orig_pfn).ok_or(EptError::InvalidFrame)?;
        let pte = self.pte_mut(orig, false)?;
        if access.contains(Permission::EXECUTE) {
            let exec = Pa::from_pfn(hook.exec_pfn).ok_or(EptError::InvalidFrame)?;
            pte.set_pa(exec)?.set_permission(Permission::EXECUTE);
        } else {
            let data = Pa::from_pfn(hook.orig_pfn).ok_or(EptError::InvalidFrame)?;
            pte.set_pa(data)?
                .set_permission(hook.saved.permission() & (Permission::READ | Permission::WRITE));
        }
        Ok(EptFlush::new())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ept, gpa};
    use super::*;

    #[test]
    fn execute_view_after_install() {
        let (_, mut ept) = ept();
        let _ = ept.install_hook(0x100, 0x200).unwrap();
        assert_eq!(
            ept.translate(gpa(0x100), Permission::EXECUTE),
            Ok(Pa::from_pfn(0x200).unwrap())
        );
        assert!(ept.translate(gpa(0x100), Permission::READ).is_err());
        assert_eq!(ept.hooks().count(), 1);
        assert_eq!(ept.hook(0x100).map(|h| h.exec_pfn), Some(0x200));
    }

    #[test]
    fn duplicate_and_invalid() {
        let (_, mut ept) = ept();
        let _ = ept.install_hook(0x100, 0x200).unwrap();
        assert_eq!(ept.install_hook(0x100, 0x300).err(), Some(EptError::Duplicated));
        assert_eq!(
            ept.install_hook(1 << 40, 0x300).err(),
            Some(EptError::InvalidFrame)
        );
        assert_eq!(
            ept.install_hook(0x101, 1 << 40).err(),
            Some(EptError::InvalidFrame)
        );
        assert_eq!(ept.hooks().count(), 1);
    }

    #[test]
    fn remove_never_installed_is_noop() {
        let (_, mut ept) = ept();
        let _ = ept.pte_mut(gpa(0x100), true).unwrap();
        let before = ept.leaf(gpa(0x100)).unwrap();
        assert_eq!(ept.remove_hook(0x100).err(), Some(EptError::NotHooked));
        assert_eq!(ept.leaf(gpa(0x100)).unwrap(), before);

        // Never split either.
        let large = ept.leaf(gpa(0x1000)).unwrap();
        assert_eq!(ept.remove_hook(0x1000).err(), Some(EptError::NotHooked));
        assert_eq!(ept.leaf(gpa(0x1000)).unwrap(), large);
        assert_eq!(ept.used_pages(), 1);
    }

    #[test]
    fn install_then_remove_restores_leaf() {
        let (_, mut ept) = ept();
        let before: Vec<_> = (0..512)
            .map(|pfn| ept.translate(gpa(pfn), Permission::FULL))
            .collect();
        let _ = ept.install_hook(0x42, 0x200).unwrap();
        let _ = ept.switch_hook_view(*ept.hook(0x42).unwrap(), Permission::READ).unwrap();
        let _ = ept.remove_hook(0x42).unwrap();
        let after: Vec<_> = (0..512)
            .map(|pfn| ept.translate(gpa(pfn), Permission::FULL))
            .collect();
        assert_eq!(before, after);
        assert!(ept.hook(0x42).is_none());
    }

    #[test]
    fn table_full() {
        let (_, mut ept) = ept();
        for i in 0..crate::config::EPT_HOOK_COUNT as u64 {
            let _ = ept.install_hook(0x100 + i, 0x400).unwrap();
        }
        assert_eq!(
            ept.install_hook(0x180, 0x400).err(),
            Some(EptError::HookTableFull)
        );
    }
}
