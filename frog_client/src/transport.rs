//! The trap into the hypervisor.
use frog_abi::HypercallInput;

/// The processor executed `vmcall` outside of VMX non-root operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotVirtualized;

/// Something that can issue a hypercall on the current processor.
pub trait Hypercaller {
    /// Issue `input` and return rax.
    ///
    /// Returns [`NotVirtualized`] when the trap faulted instead of reaching the
    /// hypervisor.
    fn vmcall(&self, input: &HypercallInput) -> Result<u64, NotVirtualized>;
}

impl<T: Hypercaller + ?Sized> Hypercaller for &T {
    fn vmcall(&self, input: &HypercallInput) -> Result<u64, NotVirtualized> {
        (**self).vmcall(input)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Hypercalls through the `vmcall` instruction.
        pub struct Vmcall {
            _private: (),
        }

        impl Vmcall {
            /// Create the transport.
            ///
            /// # Safety
            /// Every processor the transport is used on must either run under
            /// the hypervisor or have its #UD handled by the environment.
            pub const unsafe fn new() -> Self {
                Self { _private: () }
            }
        }

        impl Hypercaller for Vmcall {
            fn vmcall(&self, input: &HypercallInput) -> Result<u64, NotVirtualized> {
                // SAFETY: guaranteed by the contract of `Vmcall::new`.
                Ok(unsafe { abyss::x86_64::intrinsics::vmcall(input.to_rax(), input.args) })
            }
        }
    }
}
