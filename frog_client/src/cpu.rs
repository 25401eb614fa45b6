//! Running work on every logical processor.
//!
//! Hooks, hidden pages and monitoring regions live in the EPT of a single
//! processor, so most stealth operations are repeated once per processor.

/// The processors of the machine and a way to run code pinned to one of them.
pub trait Processors {
    /// Number of logical processors.
    fn count(&self) -> usize;

    /// Run `f` with the calling thread pinned to processor `cpu`.
    fn run_on(&self, cpu: usize, f: &mut dyn FnMut());
}

/// Run `f` once on every processor, in index order.
pub fn for_each_cpu<P: Processors + ?Sized>(processors: &P, mut f: impl FnMut(usize)) {
    for cpu in 0..processors.count() {
        processors.run_on(cpu, &mut || f(cpu));
    }
}
