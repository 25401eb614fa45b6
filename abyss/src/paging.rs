//! 4-level page table entries of x86_64.
//!
//! These are the entries the hypervisor writes into its own host page tables
//! and the entries it reads when walking a guest's page tables. Each entry is a
//! `u64` newtype; the frame lives in bits 12..52 and everything else is a flag.
//!
//! ```text
//! 63          48 47            39 38            30 29            21 20         12 11         0
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! | Sign Extend |    Page-Map    | Page-Directory | Page-directory |  Page-Table |    Page    |
//! |             | Level-4 Offset |    Pointer     |     Offset     |   Offset    |   Offset   |
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! ```
use crate::{
    addressing::{Pa, FRAME_MASK, PAGE_MASK},
    ENTRY_COUNT,
};
use core::ops::{Deref, DerefMut};

/// A list specifying categories of page table operation error.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address
    Unaligned,
    /// Not exist
    NotExist,
}

/// A 4 KiB, page aligned table of 512 entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable<E: Copy>(pub [E; ENTRY_COUNT]);

impl<E: Copy> PageTable<E> {
    /// Table whose entries are all `e`.
    pub const fn filled(e: E) -> Self {
        Self([e; ENTRY_COUNT])
    }
}

impl<E: Copy> Deref for PageTable<E> {
    type Target = [E; ENTRY_COUNT];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Copy> DerefMut for PageTable<E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

macro_rules! host_entry {
    ($(#[$m:meta])* $name:ident, $flags:ident) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Entry with no bits set.
            pub const EMPTY: Self = Self(0);

            /// Get a physical address pointed by this entry.
            ///
            /// Returns `None` if the entry is not present.
            #[inline]
            pub const fn pa(&self) -> Option<Pa> {
                if self.0 & $flags::P.bits() != 0 {
                    Pa::new(self.0 & FRAME_MASK)
                } else {
                    None
                }
            }

            /// Get a flags this entry.
            #[inline]
            pub const fn flags(&self) -> $flags {
                $flags::from_bits_truncate(self.0)
            }

            /// Set physical address of this entry.
            ///
            /// # WARNING
            /// Permission of this entry is not changed.
            #[inline]
            pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
                let pa = pa.into_u64();
                if pa & PAGE_MASK != 0 {
                    Err(PageTableMappingError::Unaligned)
                } else {
                    self.0 = pa | (self.0 & !FRAME_MASK);
                    Ok(self)
                }
            }

            /// Set a permission of this entry.
            #[inline]
            pub fn set_perm(&mut self, perm: $flags) -> &mut Self {
                self.0 = (self.0 & FRAME_MASK) | perm.bits();
                self
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({:#x}, {:?})"),
                    self.0 & FRAME_MASK,
                    self.flags()
                )
            }
        }
    };
}

host_entry!(
    /// Page Map Level 4 entry.
    Pml4e,
    Pml4eFlags
);
host_entry!(
    /// Page Directory Pointer Table entry.
    Pdpe,
    PdpeFlags
);
host_entry!(
    /// Page Directory entry.
    Pde,
    PdeFlags
);
host_entry!(
    /// Page Table entry.
    Pte,
    PteFlags
);

impl Pdpe {
    /// Whether this entry maps a 1 GiB page instead of referencing a page directory.
    #[inline]
    pub const fn is_huge(&self) -> bool {
        self.0 & PdpeFlags::PS.bits() != 0
    }
}

impl Pde {
    /// Whether this entry maps a 2 MiB page instead of referencing a page table.
    #[inline]
    pub const fn is_large(&self) -> bool {
        self.0 & PdeFlags::PS.bits() != 0
    }
}

bitflags::bitflags! {
    /// Flags for pml4e.
    pub struct Pml4eFlags: u64 {
        /// Present; must be 1 to reference a page-directory-pointer table
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 512-GByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 512-GByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether this entry has been used for linear-address translation
        const A = 1 << 5;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pdpe.
    pub struct PdpeFlags: u64 {
        /// Present; must be 1 to map a 1-GByte page or reference a page directory
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 1-GByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 1-GByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed
        const A = 1 << 5;
        /// Dirty; only meaningful when this entry maps a 1-GByte page
        const D = 1 << 6;
        /// Page size; must be 1 to map a 1-GByte page
        const PS = 1 << 7;
        /// Global; only meaningful when this entry maps a 1-GByte page
        const G = 1 << 8;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pde.
    pub struct PdeFlags: u64 {
        /// Present; must be 1 to map a 2-MByte page or reference a page table
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 2-MByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 2-MByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed
        const A = 1 << 5;
        /// Dirty; only meaningful when this entry maps a 2-MByte page
        const D = 1 << 6;
        /// Page size; must be 1 to map a 2-MByte page
        const PS = 1 << 7;
        /// Global; only meaningful when this entry maps a 2-MByte page
        const G = 1 << 8;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: u64 {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed
        const A = 1 << 5;
        /// Dirty
        const D = 1 << 6;
        /// Indirectly determines the memory type used to access the 4-KByte page
        const PAT = 1 << 7;
        /// Global
        const G = 1 << 8;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_present_has_no_pa() {
        let mut e = Pde::EMPTY;
        assert_eq!(e.pa(), None);
        e.set_pa(Pa::new(0x20_0000).unwrap()).unwrap();
        assert_eq!(e.pa(), None);
        e.set_perm(PdeFlags::P | PdeFlags::RW | PdeFlags::PS);
        assert_eq!(e.pa(), Pa::new(0x20_0000));
        assert!(e.is_large());
    }

    #[test]
    fn set_pa_rejects_unaligned() {
        let mut e = Pte::EMPTY;
        assert_eq!(
            e.set_pa(Pa::new(0x1001).unwrap()).err(),
            Some(PageTableMappingError::Unaligned)
        );
    }

    #[test]
    fn set_pa_keeps_flags() {
        let mut e = Pml4e(0);
        e.set_perm(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::XD);
        e.set_pa(Pa::new(0xdead_b000).unwrap()).unwrap();
        assert_eq!(e.flags(), Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::XD);
        assert_eq!(e.pa(), Pa::new(0xdead_b000));
        e.set_perm(Pml4eFlags::P);
        assert_eq!(e.pa(), Pa::new(0xdead_b000));
        assert!(!e.flags().contains(Pml4eFlags::RW));
    }
}
