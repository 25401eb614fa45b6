//! Millisecond time shared with the hypervisor's mailbox.
//!
//! Mailbox timestamps are milliseconds since boot, derived from the platform
//! performance counter. The driver and its clients read the same counter, so
//! their timestamps agree to the millisecond.

/// Source of mailbox timestamps. Also the only way the client waits.
pub trait Clock {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;

    /// Block for at least `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// A free-running counter with a fixed frequency.
pub trait PerformanceCounter {
    /// Current count.
    fn counter(&self) -> u64;
    /// Counts per second.
    fn frequency(&self) -> u64;
}

/// Convert a counter value to milliseconds. `0` for a zero frequency.
pub fn counter_to_ms(counter: u64, frequency: u64) -> u64 {
    if frequency == 0 {
        return 0;
    }
    (counter as u128 * 1000 / frequency as u128) as u64
}

/// A [`Clock`] over a [`PerformanceCounter`].
pub struct CounterClock<C> {
    counter: C,
}

impl<C: PerformanceCounter> CounterClock<C> {
    /// Clock reading `counter`.
    pub const fn new(counter: C) -> Self {
        Self { counter }
    }
}

impl<C: PerformanceCounter> Clock for CounterClock<C> {
    fn now_ms(&self) -> u64 {
        counter_to_ms(self.counter.counter(), self.counter.frequency())
    }

    fn sleep_ms(&self, ms: u64) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                std::thread::sleep(std::time::Duration::from_millis(ms));
            } else {
                let deadline = self.now_ms().saturating_add(ms);
                let backoff = crossbeam_utils::Backoff::new();
                while self.now_ms() < deadline {
                    backoff.snooze();
                }
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The time-stamp counter, given its invariant frequency.
        pub struct Tsc {
            frequency: u64,
        }

        impl Tsc {
            /// Counter ticking at `frequency` Hz.
            pub const fn new(frequency: u64) -> Self {
                Self { frequency }
            }
        }

        impl PerformanceCounter for Tsc {
            fn counter(&self) -> u64 {
                abyss::x86_64::intrinsics::rdtsc()
            }

            fn frequency(&self) -> u64 {
                self.frequency
            }
        }
    }
}

#[cfg(feature = "std")]
pub use self::std_clock::StdClock;

#[cfg(feature = "std")]
mod std_clock {
    use super::Clock;
    use std::time::{Duration, Instant};

    /// Monotonic clock of the running process.
    ///
    /// Its origin is the moment it was created, so it only agrees with peers
    /// that share the same `StdClock`.
    pub struct StdClock {
        origin: Instant,
    }

    impl StdClock {
        /// Clock starting at zero now.
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
            }
        }
    }

    impl Default for StdClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for StdClock {
        fn now_ms(&self) -> u64 {
            self.origin.elapsed().as_millis() as u64
        }

        fn sleep_ms(&self, ms: u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Fake {
        count: Cell<u64>,
        frequency: u64,
    }

    impl PerformanceCounter for Fake {
        fn counter(&self) -> u64 {
            // Every read advances a quarter millisecond.
            let c = self.count.get();
            self.count.set(c + self.frequency / 4000);
            c
        }

        fn frequency(&self) -> u64 {
            self.frequency
        }
    }

    #[test]
    fn counter_conversion() {
        assert_eq!(counter_to_ms(10_000_000, 10_000_000), 1000);
        assert_eq!(counter_to_ms(9_999, 10_000_000), 0);
        assert_eq!(counter_to_ms(u64::MAX, 1000), u64::MAX);
        assert_eq!(counter_to_ms(5, 0), 0);
    }

    #[test]
    #[cfg(not(feature = "std"))]
    fn sleep_reaches_deadline() {
        let clock = CounterClock::new(Fake {
            count: Cell::new(0),
            frequency: 3_000_000_000,
        });
        let start = clock.now_ms();
        clock.sleep_ms(3);
        assert!(clock.now_ms() >= start + 3);
    }
}
