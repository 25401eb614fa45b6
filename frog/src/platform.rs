//! The seam between the hypervisor and the machine it runs on.
//!
//! Every access to physical memory, every EPT invalidation and every clock
//! read goes through [`Platform`]. On hardware this is [`HostPlatform`]; the
//! tests run the same code against a memory-backed simulation.
use abyss::{addressing::Pa, ept::MemoryType};

/// A failed access to physical memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AccessFault {
    /// No memory backs this physical address.
    NotBacked(Pa),
}

/// Services the hypervisor needs from the machine.
pub trait Platform: Send + Sync {
    /// Copy physical memory starting at `pa` into `buf`.
    fn read_physical(&self, pa: Pa, buf: &mut [u8]) -> Result<(), AccessFault>;

    /// Copy `buf` into physical memory starting at `pa`.
    fn write_physical(&self, pa: Pa, buf: &[u8]) -> Result<(), AccessFault>;

    /// Physical address of a hypervisor allocation.
    ///
    /// Tables handed to the processor (host paging, EPT) are referenced by
    /// physical address.
    fn physical_address_of(&self, va: *const u8) -> Option<Pa>;

    /// Drop every cached EPT translation on this processor.
    fn invalidate_ept(&self);

    /// Monotonic timestamp used to stamp log records.
    fn timestamp(&self) -> u64;

    /// Memory type of the 2 MiB region starting at `pa` in the identity EPT.
    fn memory_type(&self, _pa: Pa) -> MemoryType {
        MemoryType::WriteBack
    }

    /// Read a little endian `u64` from physical memory.
    fn read_u64(&self, pa: Pa) -> Result<u64, AccessFault> {
        let mut b = [0; 8];
        self.read_physical(pa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use abyss::x86_64::intrinsics;
        use core::sync::atomic::{AtomicBool, Ordering};

        /// Translations the OS provides while the hypervisor is being set up.
        #[derive(Clone, Copy)]
        pub struct OsServices {
            /// Physical address of a kernel virtual address, 0 if unmapped.
            pub virt_to_phys: fn(*const u8) -> u64,
            /// Kernel virtual address of a physical address, null if unmapped.
            pub phys_to_virt: fn(u64) -> *mut u8,
        }

        /// The machine itself.
        ///
        /// Before [`HostPlatform::enter_root`] physical memory is reached through
        /// the OS mapping. Afterwards it is reached through the host physical
        /// memory map, which exists only while the host page tables are active.
        pub struct HostPlatform {
            os: OsServices,
            in_root: AtomicBool,
        }

        impl HostPlatform {
            /// Create a platform that borrows the OS translations.
            pub const fn new(os: OsServices) -> Self {
                Self {
                    os,
                    in_root: AtomicBool::new(false),
                }
            }

            /// Switch physical accesses to the host physical memory map.
            ///
            /// # Safety
            /// Every processor that calls into this platform afterwards must run
            /// on the host page tables.
            pub unsafe fn enter_root(&self) {
                self.in_root.store(true, Ordering::Release);
            }

            fn pointer(&self, pa: Pa, len: usize) -> Result<*mut u8, AccessFault> {
                if self.in_root.load(Ordering::Acquire) {
                    let end = pa
                        .into_u64()
                        .checked_add(len as u64)
                        .ok_or(AccessFault::NotBacked(pa))?;
                    let last = Pa::new(end.saturating_sub(1)).and_then(|p| p.into_host_va());
                    match (pa.into_host_va(), last) {
                        (Some(va), Some(_)) => Ok(va.into_u64() as *mut u8),
                        _ => Err(AccessFault::NotBacked(pa)),
                    }
                } else {
                    let p = (self.os.phys_to_virt)(pa.into_u64());
                    if p.is_null() {
                        Err(AccessFault::NotBacked(pa))
                    } else {
                        Ok(p)
                    }
                }
            }
        }

        impl Platform for HostPlatform {
            fn read_physical(&self, pa: Pa, buf: &mut [u8]) -> Result<(), AccessFault> {
                let src = self.pointer(pa, buf.len())?;
                unsafe {
                    core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len())
                };
                Ok(())
            }

            fn write_physical(&self, pa: Pa, buf: &[u8]) -> Result<(), AccessFault> {
                let dst = self.pointer(pa, buf.len())?;
                unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) };
                Ok(())
            }

            fn physical_address_of(&self, va: *const u8) -> Option<Pa> {
                match (self.os.virt_to_phys)(va) {
                    0 => None,
                    pa => Pa::new(pa),
                }
            }

            fn invalidate_ept(&self) {
                if self.in_root.load(Ordering::Acquire) {
                    unsafe { intrinsics::invept_all_context() };
                }
            }

            fn timestamp(&self) -> u64 {
                intrinsics::rdtsc()
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            fn identity_virt(pa: u64) -> *mut u8 {
                pa as *mut u8
            }

            fn identity_phys(va: *const u8) -> u64 {
                va as u64
            }

            #[test]
            fn os_mapping_before_root() {
                let platform = HostPlatform::new(OsServices {
                    virt_to_phys: identity_phys,
                    phys_to_virt: identity_virt,
                });
                let mut backing = [0u8; 16];
                let pa = platform.physical_address_of(backing.as_mut_ptr() as *const u8).unwrap();
                platform.write_physical(pa + 4, &0xfeed_u64.to_le_bytes()).unwrap();
                assert_eq!(platform.read_u64(pa + 4), Ok(0xfeed));
                backing[0] = 1;
                let mut one = [0u8; 1];
                platform.read_physical(pa, &mut one).unwrap();
                assert_eq!(one, [1]);
                // No EPT is active yet, so this must not issue invept.
                platform.invalidate_ept();
            }
        }
    }
}
