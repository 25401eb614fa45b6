//! The mailbox.
//!
//! One slot shared by the driver, the hypervisor and every client. A send
//! overwrites the slot; there is no queue and no acknowledgement. Readers
//! tell a new message apart only by its timestamp, which the sender takes
//! from its own millisecond clock.
//!
//! Writers are not serialized against each other. Two concurrent sends may
//! leave a slot mixing fields of both; the timestamp is stored last so a
//! reader that saw a new timestamp also sees the fields written before it by
//! the same sender.
use core::sync::atomic::{AtomicU64, Ordering};

/// Content of the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Payload.
    pub content: u64,
    /// Type, one of `frog_abi::message::kind`.
    pub kind: u64,
    /// Milliseconds since boot, on the sender's clock.
    pub time: u64,
    /// Sender id; `0` is the driver.
    pub sender: u64,
}

/// The slot.
#[derive(Default)]
pub struct Mailbox {
    content: AtomicU64,
    kind: AtomicU64,
    time: AtomicU64,
    sender: AtomicU64,
}

impl Mailbox {
    /// An empty slot.
    pub const fn new() -> Self {
        Self {
            content: AtomicU64::new(0),
            kind: AtomicU64::new(0),
            time: AtomicU64::new(0),
            sender: AtomicU64::new(0),
        }
    }

    /// Overwrite the slot.
    pub fn send(&self, message: Message) {
        self.content.store(message.content, Ordering::Relaxed);
        self.kind.store(message.kind, Ordering::Relaxed);
        self.sender.store(message.sender, Ordering::Relaxed);
        self.time.store(message.time, Ordering::Release);
    }

    /// Current content.
    pub fn content(&self) -> u64 {
        self.content.load(Ordering::Acquire)
    }

    /// Current type.
    pub fn kind(&self) -> u64 {
        self.kind.load(Ordering::Acquire)
    }

    /// Current timestamp.
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::Acquire)
    }

    /// Current sender.
    pub fn sender(&self) -> u64 {
        self.sender.load(Ordering::Acquire)
    }

    /// Every field at once.
    pub fn snapshot(&self) -> Message {
        let time = self.time();
        Message {
            content: self.content(),
            kind: self.kind(),
            time,
            sender: self.sender(),
        }
    }
}
