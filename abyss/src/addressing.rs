//! Memory abstraction.
//!
//! While the hypervisor runs in VMX root operation it uses its own page tables.
//! The first 128 GiB of physical memory are mapped in a single PML4 slot
//! ([`HOST_PHYSICAL_MEMORY_PML4_INDEX`]) with 2 MiB pages, so a physical address
//! and its host virtual address differ only by the constant
//! [`HOST_PHYSICAL_MEMORY_BASE`]. Nothing above [`HOST_PHYSICAL_MEMORY_SIZE`] is
//! reachable that way.
//!
//! The guest side has its own pair of address types, [`Gpa`] and [`Gva`]. With
//! the identity EPT installed at virtualization time a guest physical address
//! names the same frame as the host physical address of the same value, except
//! for frames the stealth engine redirected.

/// Page size.
pub const PAGE_SIZE: u64 = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: u64 = 12;
/// Mask for page offset.
pub const PAGE_MASK: u64 = 0xfff;
/// Size of a page mapped by a page-directory entry.
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
/// Size of a page mapped by a page-directory-pointer entry.
pub const HUGE_PAGE_SIZE: u64 = 0x4000_0000;

/// PML4 slot that holds the map of physical memory in the host address space.
pub const HOST_PHYSICAL_MEMORY_PML4_INDEX: usize = 255;
/// Host virtual address of physical address 0.
pub const HOST_PHYSICAL_MEMORY_BASE: u64 = (HOST_PHYSICAL_MEMORY_PML4_INDEX as u64) << 39;
/// Amount of physical memory reachable through the host physical map.
pub const HOST_PHYSICAL_MEMORY_SIZE: u64 = 128 << 30;

/// Bits 12..52 of a paging-structure entry.
pub(crate) const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
const MAX_PHYSICAL_ADDRESS: u64 = 1 << 52;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(u64);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < MAX_PHYSICAL_ADDRESS {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Physical address of the first byte of frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: u64) -> Option<Self> {
        if pfn < (MAX_PHYSICAL_ADDRESS >> PAGE_SHIFT) {
            Some(Self(pfn << PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset inside the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Round down to the start of the page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Cast into the host virtual address of the physical memory map.
    ///
    /// Returns `None` when the address lies beyond the mapped 128 GiB.
    #[inline]
    pub const fn into_host_va(self) -> Option<Va> {
        if self.0 < HOST_PHYSICAL_MEMORY_SIZE {
            Some(Va(self.0 + HOST_PHYSICAL_MEMORY_BASE))
        } else {
            None
        }
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(u64);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: u64) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Cast into physical address if this address lies in the host physical map.
    #[inline]
    pub const fn into_host_pa(self) -> Option<Pa> {
        if self.0 >= HOST_PHYSICAL_MEMORY_BASE
            && self.0 < HOST_PHYSICAL_MEMORY_BASE + HOST_PHYSICAL_MEMORY_SIZE
        {
            Some(Pa(self.0 - HOST_PHYSICAL_MEMORY_BASE))
        } else {
            None
        }
    }

    /// Index into the page-map level-4 table.
    #[inline]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// Index into the page-directory-pointer table.
    #[inline]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// Index into the page directory.
    #[inline]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// Index into the page table.
    #[inline]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }

    /// Offset inside the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address with a check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < MAX_PHYSICAL_ADDRESS {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Guest physical address of the first byte of frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: u64) -> Option<Self> {
        if pfn < (MAX_PHYSICAL_ADDRESS >> PAGE_SHIFT) {
            Some(Self(pfn << PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset inside the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Round down to the start of the page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Index into the EPT PML4.
    #[inline]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// Index into the EPT page-directory-pointer table.
    #[inline]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// Index into the EPT page directory.
    #[inline]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// Index into the EPT page table.
    #[inline]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }
}

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gva(u64);

impl Gva {
    /// Create a new guest virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: u64) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Reinterpret as a host virtual address; the indices are the same.
    #[inline]
    pub const fn as_va(self) -> Va {
        Va(self.0)
    }

    /// Offset inside the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::SubAssign<u64> for $t {
            fn sub_assign(&mut self, other: u64) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<u64> for $t {
            type Output = Self;

            fn bitor(self, other: u64) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);
impl_arith!(Gva);
impl_arith!(Gpa);

macro_rules! impl_fmt {
    ($t: ident) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
    };
}

impl_fmt!(Va);
impl_fmt!(Pa);
impl_fmt!(Gva);
impl_fmt!(Gpa);
