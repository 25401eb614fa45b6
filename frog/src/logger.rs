//! Root mode logging.
//!
//! Nothing in root mode may call into the OS, so log lines go into a fixed
//! ring of [`LogRecord`]s that clients drain with the flush logs hypercall.
//! Producers never block: once the ring is full, every new record evicts the
//! oldest unread one. Readers notice the loss as a gap in record ids.
use crate::config::LOG_CAPACITY;
use core::{
    fmt::{self, Write},
    sync::atomic::{AtomicU64, Ordering},
};
use crossbeam_queue::ArrayQueue;
use frog_abi::LogRecord;

/// Fixed buffer a log line is formatted into.
struct LineBuffer {
    buf: [u8; LogRecord::MAX_TEXT],
    len: usize,
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep one byte for the terminating NUL; drop whatever does not fit.
        let room = LogRecord::MAX_TEXT - 1 - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// The log ring.
pub struct Logger {
    ring: ArrayQueue<LogRecord>,
    next_id: AtomicU64,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl Logger {
    /// Create a ring holding `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append one record. Returns its id.
    pub fn write(&self, tsc: u64, aux: u32, args: fmt::Arguments<'_>) -> u64 {
        let mut line = LineBuffer {
            buf: [0; LogRecord::MAX_TEXT],
            len: 0,
        };
        let _ = line.write_fmt(args);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .ring
            .force_push(LogRecord::new(id, tsc, aux, &line.buf[..line.len]));
        id
    }

    /// Oldest unread record.
    pub fn pop(&self) -> Option<LogRecord> {
        self.ring.pop()
    }

    /// Unread records.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether every record was read.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records the ring holds at most.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Log an information message on behalf of processor `cpu`.
///
/// Use the format! syntax. The line is truncated to fit one record.
#[macro_export]
macro_rules! info {
    ($hv:expr, $cpu:expr, $($arg:tt)*) => {
        $hv.log($cpu, format_args!("[INFO] {}", format_args!($($arg)*)))
    };
}

/// Log a warning message on behalf of processor `cpu`.
#[macro_export]
macro_rules! warning {
    ($hv:expr, $cpu:expr, $($arg:tt)*) => {
        $hv.log($cpu, format_args!("[WARNING] {}", format_args!($($arg)*)))
    };
}

/// Log msg if debug build
#[macro_export]
macro_rules! debug {
    ($hv:expr, $cpu:expr, $($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $hv.log($cpu, format_args!("[DEBUG] {}", format_args!($($arg)*)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let logger = Logger::new(8);
        for i in 0..3 {
            logger.write(100 + i, 1, format_args!("line {}", i));
        }
        for i in 0..3 {
            let r = logger.pop().unwrap();
            assert_eq!(r.id, i);
            assert_eq!(r.tsc, 100 + i);
            assert_eq!(r.aux, 1);
            assert_eq!(r.as_str(), Some(alloc::format!("line {}", i).as_str()));
        }
        assert!(logger.is_empty());
        assert_eq!(logger.pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let logger = Logger::new(4);
        for i in 0..10 {
            logger.write(0, 0, format_args!("{}", i));
        }
        assert_eq!(logger.len(), 4);
        let ids: alloc::vec::Vec<_> = core::iter::from_fn(|| logger.pop()).map(|r| r.id).collect();
        assert_eq!(ids, [6, 7, 8, 9]);
    }

    #[test]
    fn partial_drain_keeps_rest() {
        let logger = Logger::new(8);
        for i in 0..5 {
            logger.write(0, 0, format_args!("{}", i));
        }
        let ids: alloc::vec::Vec<_> = core::iter::from_fn(|| logger.pop())
            .take(2)
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, [0, 1]);
        assert_eq!(logger.len(), 3);
        assert_eq!(logger.pop().map(|r| r.id), Some(2));
    }

    #[test]
    fn long_lines_are_truncated() {
        let logger = Logger::new(2);
        let long = "x".repeat(500);
        logger.write(0, 0, format_args!("{}", long));
        let r = logger.pop().unwrap();
        assert_eq!(r.text().len(), LogRecord::MAX_TEXT - 1);
        assert_eq!(r.data[LogRecord::MAX_TEXT - 1], 0);
    }
}
