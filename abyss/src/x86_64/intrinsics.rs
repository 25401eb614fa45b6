//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! Every function here is a single instruction. On other architectures the
//! module is empty so the rest of the workspace still builds for host tests.
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/beta/core/arch/x86_64/index.html

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use core::arch::asm;

        /// read current cr3.
        pub fn read_cr3() -> u64 {
            unsafe {
                let r: u64;
                asm!("mov {}, cr3", out(reg) r, options(nomem, nostack, preserves_flags));
                r
            }
        }

        /// Load cr3.
        ///
        /// # Safety
        /// `cr3` must reference page tables that map the currently running code.
        pub unsafe fn write_cr3(cr3: u64) {
            asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }

        /// Read the time-stamp counter.
        pub fn rdtsc() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }

        /// Issue a `vmcall` with `rax` and the six argument registers
        /// rcx, rdx, r8, r9, r10, r11. Returns rax after the call.
        ///
        /// # Safety
        /// Outside of a guest with a hypervisor that handles `vmcall`, this
        /// raises #UD.
        pub unsafe fn vmcall(rax: u64, args: [u64; 6]) -> u64 {
            let out: u64;
            asm!(
                "vmcall",
                inlateout("rax") rax => out,
                inlateout("rcx") args[0] => _,
                inlateout("rdx") args[1] => _,
                inlateout("r8") args[2] => _,
                inlateout("r9") args[3] => _,
                inlateout("r10") args[4] => _,
                inlateout("r11") args[5] => _,
                options(nostack)
            );
            out
        }

        /// Invalidate cached EPT translations of every EPTP (all-context).
        ///
        /// # Safety
        /// Must be executed in VMX root operation.
        pub unsafe fn invept_all_context() {
            let descriptor: [u64; 2] = [0, 0];
            asm!(
                "invept {}, [{}]",
                in(reg) 2u64,
                in(reg) descriptor.as_ptr(),
                options(nostack)
            );
        }
    }
}
