//! Hypercall numbering and register convention.
//!
//! ```text
//! rax = code (bits 0..8) | key (bits 8..64)
//! rcx, rdx, r8, r9, r10, r11 = args[0..6]
//! ```
//!
//! The result is returned in rax.
use crate::HYPERCALL_KEY;
use num_enum::{IntoPrimitive, TryFromPrimitive};

const KEY_BITS: u32 = 56;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

/// Hypercall indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HypercallCode {
    /// Returns the hypervisor signature.
    Ping = 0,
    /// Logs diagnostic information about the calling processor.
    Test,
    /// Devirtualizes the calling processor.
    Unload,
    /// Copies physical memory into a caller buffer.
    ReadPhysMem,
    /// Copies a caller buffer into physical memory.
    WritePhysMem,
    /// Copies virtual memory of an address space into a caller buffer.
    ReadVirtMem,
    /// Copies a caller buffer into virtual memory of an address space.
    WriteVirtMem,
    /// Looks up the kernel CR3 of a process.
    QueryProcessCr3,
    /// Installs an execute hook on the calling processor.
    InstallEptHook,
    /// Removes an execute hook from the calling processor.
    RemoveEptHook,
    /// Drains the log ring into a caller buffer.
    FlushLogs,
    /// Translates a virtual address through a CR3.
    GetPhysicalAddress,
    /// Hides a physical frame from the calling processor's guest view.
    HidePhysicalPage,
    /// Restores a hidden frame.
    UnhidePhysicalPage,
    /// Returns the hypervisor image base.
    GetHvBase,
    /// Installs a memory monitoring region.
    InstallMmr,
    /// Removes a memory monitoring region.
    RemoveMmr,
    /// Removes every memory monitoring region of the calling processor.
    RemoveAllMmrs,
    /// Overwrites the mailbox slot.
    SendMessage,
    /// Reads the mailbox content.
    GetMessage,
    /// Reads the mailbox message type.
    GetMessageType,
    /// Reads the mailbox timestamp.
    GetMessageTime,
    /// Reads the mailbox sender id.
    GetMessageSender,
}

impl HypercallCode {
    /// Number of defined hypercalls.
    pub const COUNT: usize = HypercallCode::GetMessageSender as usize + 1;
}

/// A decoded hypercall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercallInput {
    /// Raw code byte, which may not name a known hypercall.
    pub code: u8,
    /// Key, 56 bits wide.
    pub key: u64,
    /// rcx, rdx, r8, r9, r10, r11.
    pub args: [u64; 6],
}

impl HypercallInput {
    /// Hypercall `code` with the shared key and `args`.
    pub fn new(code: HypercallCode, args: [u64; 6]) -> Self {
        Self::with_key(code.into(), HYPERCALL_KEY, args)
    }

    /// Hypercall with an arbitrary code byte and key. The key is truncated to 56 bits.
    pub const fn with_key(code: u8, key: u64, args: [u64; 6]) -> Self {
        Self {
            code,
            key: key & KEY_MASK,
            args,
        }
    }

    /// Value loaded into rax before `vmcall`.
    pub const fn to_rax(&self) -> u64 {
        (self.code as u64) | (self.key << 8)
    }

    /// Decode a trapped call from rax and the six argument registers.
    pub const fn from_registers(rax: u64, args: [u64; 6]) -> Self {
        Self {
            code: rax as u8,
            key: rax >> 8,
            args,
        }
    }

    /// Whether the key matches the shared key.
    pub const fn is_authentic(&self) -> bool {
        self.key == HYPERCALL_KEY
    }

    /// The hypercall named by the code byte, if any.
    pub fn hypercall(&self) -> Option<HypercallCode> {
        HypercallCode::try_from(self.code).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rax_layout() {
        let input = HypercallInput::new(HypercallCode::Ping, [0; 6]);
        assert_eq!(input.to_rax(), 69420 << 8);
        let input = HypercallInput::new(HypercallCode::GetMessageSender, [0; 6]);
        assert_eq!(input.to_rax() & 0xff, 22);
    }

    #[test]
    fn registers_decode() {
        let args = [1, 2, 3, 4, 5, 6];
        let input = HypercallInput::from_registers((69420 << 8) | 15, args);
        assert!(input.is_authentic());
        assert_eq!(input.hypercall(), Some(HypercallCode::InstallMmr));
        assert_eq!(input.args, args);
    }

    #[test]
    fn key_is_56_bits() {
        let input = HypercallInput::with_key(0, u64::MAX, [0; 6]);
        assert_eq!(input.key, (1 << 56) - 1);
        assert_eq!(input.to_rax(), u64::MAX & !0xff);
        assert!(!input.is_authentic());
    }

    #[test]
    fn unknown_codes() {
        assert_eq!(HypercallCode::COUNT, 23);
        for code in 23..=255u8 {
            assert_eq!(HypercallInput::with_key(code, HYPERCALL_KEY, [0; 6]).hypercall(), None);
        }
    }
}
