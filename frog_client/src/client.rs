//! Typed wrappers around the hypercalls.
//!
//! Addresses handed to the memory wrappers are virtual addresses of the
//! calling address space unless the name says otherwise. The hypervisor
//! translates them through the CR3 that was live at the `vmcall`, so they must
//! stay mapped until the call returns.
use crate::{clock::Clock, transport::Hypercaller};
use frog_abi::{
    message::sender, HypercallCode, HypercallInput, MmrMode, HYPERCALL_FAILURE,
    HYPERVISOR_SIGNATURE,
};

/// Cadence of [`Client::wait_for_message`].
pub const POLL_INTERVAL_MS: u64 = 10;

/// A hypercall client.
pub struct Client<H, C> {
    hypercaller: H,
    clock: C,
    sender: u64,
}

impl<H: Hypercaller, C: Clock> Client<H, C> {
    /// Client whose messages carry the sender id `sender`.
    pub const fn new(hypercaller: H, clock: C, sender: u64) -> Self {
        Self {
            hypercaller,
            clock,
            sender,
        }
    }

    /// Client of the driver that loads the hypervisor.
    pub const fn driver(hypercaller: H, clock: C) -> Self {
        Self::new(hypercaller, clock, sender::DRIVER)
    }

    /// The clock messages are stamped with.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Sender id of this client.
    pub fn sender(&self) -> u64 {
        self.sender
    }

    fn call(&self, code: HypercallCode, args: [u64; 6]) -> u64 {
        self.hypercaller
            .vmcall(&HypercallInput::new(code, args))
            .unwrap_or(HYPERCALL_FAILURE)
    }

    /// The hypervisor signature, or `0` without a hypervisor.
    pub fn ping(&self) -> u64 {
        self.call(HypercallCode::Ping, [0; 6])
    }

    /// Whether the current processor runs under the hypervisor.
    pub fn is_hv_running(&self) -> bool {
        self.ping() == HYPERVISOR_SIGNATURE
    }

    /// Log diagnostics of the current processor into the log ring.
    pub fn test(&self) -> u64 {
        self.call(HypercallCode::Test, [0; 6])
    }

    /// Devirtualize the current processor.
    pub fn unload(&self) -> u64 {
        self.call(HypercallCode::Unload, [0; 6])
    }

    /// Copy `size` bytes of physical memory at `src_pa` into `dst`.
    /// Returns the bytes copied.
    pub fn read_phys_mem(&self, dst: u64, src_pa: u64, size: u64) -> u64 {
        self.call(HypercallCode::ReadPhysMem, [dst, src_pa, size, 0, 0, 0])
    }

    /// Copy `size` bytes at `src` into physical memory at `dst_pa`.
    /// Returns the bytes copied.
    pub fn write_phys_mem(&self, dst_pa: u64, src: u64, size: u64) -> u64 {
        self.call(HypercallCode::WritePhysMem, [dst_pa, src, size, 0, 0, 0])
    }

    /// Copy `size` bytes at `src` of the address space `cr3` into `dst`.
    /// A `cr3` of `0` names the System address space.
    pub fn read_virt_mem(&self, cr3: u64, dst: u64, src: u64, size: u64) -> u64 {
        self.call(HypercallCode::ReadVirtMem, [cr3, dst, src, size, 0, 0])
    }

    /// Copy `size` bytes at `src` into `dst` of the address space `cr3`.
    pub fn write_virt_mem(&self, cr3: u64, dst: u64, src: u64, size: u64) -> u64 {
        self.call(HypercallCode::WriteVirtMem, [cr3, dst, src, size, 0, 0])
    }

    /// Kernel CR3 of process `pid`, or `0`.
    pub fn query_process_cr3(&self, pid: u64) -> u64 {
        self.call(HypercallCode::QueryProcessCr3, [pid, 0, 0, 0, 0, 0])
    }

    /// Make instruction fetches of frame `orig_pfn` see frame `exec_pfn` on
    /// the current processor.
    pub fn install_ept_hook(&self, orig_pfn: u64, exec_pfn: u64) -> bool {
        self.call(HypercallCode::InstallEptHook, [orig_pfn, exec_pfn, 0, 0, 0, 0]) != 0
    }

    /// Remove the hook on `orig_pfn` from the current processor.
    pub fn remove_ept_hook(&self, orig_pfn: u64) -> bool {
        self.call(HypercallCode::RemoveEptHook, [orig_pfn, 0, 0, 0, 0, 0]) != 0
    }

    /// Drain up to `count` log records into the array at `buffer`.
    /// Returns the records written.
    pub fn flush_logs(&self, count: u32, buffer: u64) -> u64 {
        self.call(HypercallCode::FlushLogs, [count as u64, buffer, 0, 0, 0, 0])
    }

    /// Physical address of `va` in the address space `cr3`, or `0`.
    pub fn get_physical_address(&self, cr3: u64, va: u64) -> u64 {
        self.call(HypercallCode::GetPhysicalAddress, [cr3, va, 0, 0, 0, 0])
    }

    /// Hide frame `pfn` from the current processor.
    pub fn hide_physical_page(&self, pfn: u64) -> bool {
        self.call(HypercallCode::HidePhysicalPage, [pfn, 0, 0, 0, 0, 0]) != 0
    }

    /// Show frame `pfn` to the current processor again.
    pub fn unhide_physical_page(&self, pfn: u64) -> bool {
        self.call(HypercallCode::UnhidePhysicalPage, [pfn, 0, 0, 0, 0, 0]) != 0
    }

    /// Kernel virtual address of the hypervisor image.
    pub fn get_hv_base(&self) -> u64 {
        self.call(HypercallCode::GetHvBase, [0; 6])
    }

    /// Watch `mode` accesses to `size` bytes of guest-physical memory at
    /// `address` on the current processor. Returns the region handle, or `0`.
    pub fn install_mmr(&self, address: u64, size: u32, mode: MmrMode) -> u64 {
        self.call(
            HypercallCode::InstallMmr,
            [address, size as u64, mode.bits() as u64, 0, 0, 0],
        )
    }

    /// Remove the region `handle` from the current processor.
    pub fn remove_mmr(&self, handle: u64) -> bool {
        self.call(HypercallCode::RemoveMmr, [handle, 0, 0, 0, 0, 0]) != 0
    }

    /// Remove every region of the current processor.
    pub fn remove_all_mmrs(&self) -> bool {
        self.call(HypercallCode::RemoveAllMmrs, [0; 6]) != 0
    }

    /// Overwrite the mailbox, stamped with the current time and this sender.
    pub fn send_message(&self, content: u64, kind: u64) -> bool {
        let time = self.clock.now_ms();
        self.call(
            HypercallCode::SendMessage,
            [content, kind, time, self.sender, 0, 0],
        ) != 0
    }

    /// Content of the mailbox.
    pub fn get_message(&self) -> u64 {
        self.call(HypercallCode::GetMessage, [0; 6])
    }

    /// Type of the mailbox message.
    pub fn get_message_type(&self) -> u64 {
        self.call(HypercallCode::GetMessageType, [0; 6])
    }

    /// Timestamp of the mailbox message.
    pub fn get_message_time(&self) -> u64 {
        self.call(HypercallCode::GetMessageTime, [0; 6])
    }

    /// Sender of the mailbox message.
    pub fn get_message_sender(&self) -> u64 {
        self.call(HypercallCode::GetMessageSender, [0; 6])
    }

    /// Wait up to `timeout` milliseconds for a message of type `kind` newer
    /// than the one in the mailbox when the wait started. Returns its content,
    /// or `0` on timeout.
    ///
    /// The mailbox is polled every [`POLL_INTERVAL_MS`]. A message only counts
    /// if its timestamp is strictly greater than the last one seen, so a
    /// message sent in the same millisecond as its predecessor is missed.
    pub fn wait_for_message(&self, timeout: u64, kind: u64) -> u64 {
        let start = self.clock.now_ms();
        let mut last_time = self.get_message_time();
        while self.clock.now_ms().saturating_sub(start) < timeout {
            let time = self.get_message_time();
            if time > last_time && self.get_message_type() == kind {
                return self.get_message();
            }
            last_time = time;
            self.clock.sleep_ms(POLL_INTERVAL_MS);
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NotVirtualized;
    use core::cell::{Cell, RefCell};

    struct Recorder {
        calls: RefCell<Vec<HypercallInput>>,
        answer: Result<u64, NotVirtualized>,
    }

    impl Recorder {
        fn new(answer: Result<u64, NotVirtualized>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                answer,
            }
        }

        fn last(&self) -> HypercallInput {
            *self.calls.borrow().last().expect("no call")
        }
    }

    impl Hypercaller for Recorder {
        fn vmcall(&self, input: &HypercallInput) -> Result<u64, NotVirtualized> {
            self.calls.borrow_mut().push(*input);
            self.answer
        }
    }

    struct Fixed(Cell<u64>);

    impl Clock for Fixed {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }

        fn sleep_ms(&self, ms: u64) {
            self.0.set(self.0.get() + ms);
        }
    }

    #[test]
    fn arguments_land_in_order() {
        let recorder = Recorder::new(Ok(1));
        let client = Client::new(&recorder, Fixed(Cell::new(777)), 42);

        assert!(client.send_message(5, 1));
        let input = recorder.last();
        assert!(input.is_authentic());
        assert_eq!(input.hypercall(), Some(HypercallCode::SendMessage));
        assert_eq!(input.args, [5, 1, 777, 42, 0, 0]);

        client.install_mmr(0x1000, 0x20, MmrMode::R | MmrMode::W);
        assert_eq!(recorder.last().args, [0x1000, 0x20, 0b011, 0, 0, 0]);

        client.read_virt_mem(0x1ad000, 0x10, 0x20, 0x30);
        let input = recorder.last();
        assert_eq!(input.hypercall(), Some(HypercallCode::ReadVirtMem));
        assert_eq!(input.args, [0x1ad000, 0x10, 0x20, 0x30, 0, 0]);
    }

    #[test]
    fn faults_read_as_failure() {
        let recorder = Recorder::new(Err(NotVirtualized));
        let client = Client::driver(&recorder, Fixed(Cell::new(0)));
        assert_eq!(client.ping(), HYPERCALL_FAILURE);
        assert!(!client.is_hv_running());
        assert!(!client.hide_physical_page(1));
        assert_eq!(client.sender(), sender::DRIVER);
    }

    #[test]
    fn wait_times_out_on_schedule() {
        let recorder = Recorder::new(Ok(0));
        let client = Client::new(&recorder, Fixed(Cell::new(1000)), 7);
        assert_eq!(client.wait_for_message(95, 1), 0);
        // Ten polls fit in 95 ms.
        assert_eq!(client.clock().now_ms(), 1100);
    }
}
