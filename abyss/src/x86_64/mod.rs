//! x86_64 specific

pub mod intrinsics;

use num_enum::TryFromPrimitive;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl PrivilegeLevel {
    /// Current privilege level held in the low two bits of a CS selector.
    pub fn from_selector(cs: u16) -> Self {
        match cs & 3 {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }
}

/// X86_64 general purpose registers
///
/// The layout is the order the VM-exit stub pushes the guest registers in;
/// rsp is kept in the VMCS and is absent here.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Mask of the page-directory base in CR3.
pub const CR3_PFN_MASK: u64 = 0x000f_ffff_ffff_f000;
