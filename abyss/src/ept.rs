//! Extended Page Table.
//!
//! EPT translates guest physical addresses to host physical addresses. Unlike
//! the regular page table, an EPT entry has no present bit: an entry is
//! present when any of its read, write or execute bits is set.
//!
//! Only the low three bits of an entry hold the access rights. The stealth
//! engine changes those bits and the frame number; the memory type and the
//! large-page bit are never touched after the identity map is built.
use crate::addressing::{Pa, FRAME_MASK, PAGE_MASK};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A list specifying categories of EPT entry operation error.
#[derive(Debug, PartialEq, Eq)]
pub enum EptMappingError {
    /// Unaligned address
    Unaligned,
    /// Not exist
    NotExist,
}

bitflags::bitflags! {
    /// Access rights of an EPT entry, bits 0..2 of every level.
    pub struct Permission: u64 {
        /// Reads are allowed from the region controlled by this entry.
        const READ = 1 << 0;
        /// Writes are allowed to the region controlled by this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed from the region controlled by this entry.
        const EXECUTE = 1 << 2;

        const FULL = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
    }
}

impl Permission {
    /// Whether an entry with these rights is legal.
    ///
    /// Write access without read access causes an EPT misconfiguration.
    #[inline]
    pub const fn is_valid(self) -> bool {
        !(self.contains(Self::WRITE) && !self.contains(Self::READ))
    }
}

/// EPT memory type, bits 3..5 of a leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable (UC).
    Uncacheable = 0,
    /// Write combining (WC).
    WriteCombining = 1,
    /// Write through (WT).
    WriteThrough = 4,
    /// Write protected (WP).
    WriteProtected = 5,
    /// Write back (WB).
    WriteBack = 6,
}

const MEMORY_TYPE_SHIFT: u64 = 3;
const MEMORY_TYPE_MASK: u64 = 0b111 << MEMORY_TYPE_SHIFT;
/// Bit 6 of a leaf: ignore the guest PAT memory type.
pub const IGNORE_PAT: u64 = 1 << 6;
/// Bit 7 of an EPT PDE or PDPTE: the entry maps a page instead of a table.
pub const LARGE_PAGE: u64 = 1 << 7;
/// Bit 11 of a leaf: ignored by the processor and free for software.
pub const SOFTWARE_AVAILABLE: u64 = 1 << 11;

macro_rules! ept_entry {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Not present entry.
            pub const EMPTY: Self = Self(0);

            /// Get a physical address pointed by this entry.
            ///
            /// Returns `None` if none of read, write and execute is allowed.
            #[inline]
            pub const fn pa(&self) -> Option<Pa> {
                if self.0 & Permission::FULL.bits() != 0 {
                    Pa::new(self.0 & FRAME_MASK)
                } else {
                    None
                }
            }

            /// Frame number referenced by this entry, present or not.
            #[inline]
            pub const fn pfn(&self) -> u64 {
                (self.0 & FRAME_MASK) >> 12
            }

            /// Get the access rights of this entry.
            #[inline]
            pub const fn permission(&self) -> Permission {
                Permission::from_bits_truncate(self.0)
            }

            /// Set physical address of this entry.
            ///
            /// # WARNING
            /// Permission of this entry is not changed.
            #[inline]
            pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, EptMappingError> {
                let pa = pa.into_u64();
                if pa & PAGE_MASK != 0 {
                    Err(EptMappingError::Unaligned)
                } else {
                    self.0 = pa | (self.0 & !FRAME_MASK);
                    Ok(self)
                }
            }

            /// Set the access rights of this entry. Other bits are kept.
            #[inline]
            pub fn set_permission(&mut self, perm: Permission) -> &mut Self {
                self.0 = perm.bits() | (self.0 & !Permission::FULL.bits());
                self
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({:#x}, {:?})"),
                    self.0 & FRAME_MASK,
                    self.permission()
                )
            }
        }
    };
}

ept_entry!(
    /// Format of an EPT PML4 Entry that references an EPT page-directory-pointer table.
    EptPml4e
);
ept_entry!(
    /// Format of an EPT page-directory-pointer-table entry.
    EptPdpe
);
ept_entry!(
    /// Format of an EPT page-directory entry.
    ///
    /// With [`LARGE_PAGE`] set the entry maps a 2 MiB page and carries a
    /// memory type; otherwise it references an EPT page table.
    EptPde
);
ept_entry!(
    /// Format of an EPT page-table entry that maps a 4 KiB page.
    EptPte
);

macro_rules! ept_leaf {
    ($name:ident) => {
        impl $name {
            /// Memory type of the page mapped by this entry.
            #[inline]
            pub fn memory_type(&self) -> Option<MemoryType> {
                MemoryType::try_from(((self.0 & MEMORY_TYPE_MASK) >> MEMORY_TYPE_SHIFT) as u8).ok()
            }

            /// Set the memory type of the page mapped by this entry.
            #[inline]
            pub fn set_memory_type(&mut self, ty: MemoryType) -> &mut Self {
                self.0 = (self.0 & !MEMORY_TYPE_MASK)
                    | ((u8::from(ty) as u64) << MEMORY_TYPE_SHIFT);
                self
            }
        }
    };
}

ept_leaf!(EptPde);
ept_leaf!(EptPte);

impl EptPde {
    /// Whether this entry maps a 2 MiB page.
    #[inline]
    pub const fn is_large(&self) -> bool {
        self.0 & LARGE_PAGE != 0
    }

    /// Mark this entry as mapping a 2 MiB page.
    #[inline]
    pub fn set_large(&mut self, large: bool) -> &mut Self {
        if large {
            self.0 |= LARGE_PAGE;
        } else {
            self.0 &= !LARGE_PAGE;
        }
        self
    }
}

/// Extended-page-table pointer, the value written to the EPTP VMCS field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Eptp(u64);

impl Eptp {
    /// EPTP for a 4-level EPT rooted at `pml4`, write-back paging-structure accesses.
    pub fn new(pml4: Pa) -> Result<Self, EptMappingError> {
        let pa = pml4.into_u64();
        if pa & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }
        // Page-walk length minus one in bits 3..5.
        Ok(Self(pa | (u8::from(MemoryType::WriteBack) as u64) | (3 << 3)))
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Physical address of the EPT PML4.
    #[inline]
    pub const fn pml4(self) -> u64 {
        self.0 & FRAME_MASK
    }
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations.
    pub struct ViolationQualification: u64 {
        /// The access causing the EPT violation was a data read.
        const READ = 1 << 0;
        /// The access causing the EPT violation was a data write.
        const WRITE = 1 << 1;
        /// The access causing the EPT violation was an instruction fetch.
        const EXECUTE = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writeable.
        const WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const GLA_VALID = 1 << 7;
    }
}

impl ViolationQualification {
    /// Kind of access that caused the violation, expressed as EPT rights.
    #[inline]
    pub const fn access(self) -> Permission {
        Permission::from_bits_truncate(self.bits & 0b111)
    }

    /// Rights the faulting entry granted at the time of the violation.
    #[inline]
    pub const fn granted(self) -> Permission {
        Permission::from_bits_truncate((self.bits >> 3) & 0b111)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_follows_permission() {
        let mut e = EptPte::EMPTY;
        e.set_pa(Pa::new(0x5000).unwrap()).unwrap();
        assert_eq!(e.pa(), None);
        assert_eq!(e.pfn(), 5);
        e.set_permission(Permission::EXECUTE);
        assert_eq!(e.pa(), Pa::new(0x5000));
    }

    #[test]
    fn permission_change_keeps_memory_type() {
        let mut e = EptPde(0);
        e.set_permission(Permission::FULL)
            .set_memory_type(MemoryType::WriteBack)
            .set_large(true);
        e.set_permission(Permission::READ);
        assert_eq!(e.memory_type(), Some(MemoryType::WriteBack));
        assert!(e.is_large());
        assert_eq!(e.permission(), Permission::READ);
    }

    #[test]
    fn write_only_is_invalid() {
        assert!(!Permission::WRITE.is_valid());
        assert!(!(Permission::WRITE | Permission::EXECUTE).is_valid());
        assert!(Permission::EXECUTE.is_valid());
        assert!(Permission::empty().is_valid());
        assert!(Permission::FULL.is_valid());
    }

    #[test]
    fn eptp_layout() {
        let eptp = Eptp::new(Pa::new(0x1234_5000).unwrap()).unwrap();
        assert_eq!(eptp.into_u64(), 0x1234_5000 | 0x1e);
        assert_eq!(eptp.pml4(), 0x1234_5000);
        assert!(Eptp::new(Pa::new(0x1234_5008).unwrap()).is_err());
    }

    #[test]
    fn qualification_split() {
        let q = ViolationQualification::from_bits_truncate(0b101_010);
        assert_eq!(q.access(), Permission::WRITE);
        assert_eq!(q.granted(), Permission::READ | Permission::EXECUTE);
    }
}
