//! A hypervisor running in process, reached through the client library.
#![allow(dead_code)]

use abyss::{
    addressing::{Gpa, Pa},
    ept::Permission,
};
use frog::{
    config::HypervisorConfig,
    testing::{guest_read, GuestPageTableBuilder, SimulatedPlatform},
    vcpu::GuestState,
    vmexit::VmExit,
    Hypervisor,
};
use frog_abi::HypercallInput;
use frog_client::{
    clock::Clock,
    transport::{Hypercaller, NotVirtualized},
    Processors,
};
use std::cell::{Cell, RefCell};

/// Kernel address the hypervisor image is loaded at.
pub const IMAGE_BASE: u64 = 0xffff_f800_0040_0000;
/// Four pages, the last of which is not mapped.
pub const IMAGE_SIZE: u64 = 0x4000;
/// First frame backing the image.
pub const IMAGE_PFN: u64 = 0x400;
/// Pages of the image that are mapped.
pub const IMAGE_MAPPED_PAGES: u64 = 3;
/// Caller buffer, four pages.
pub const BUFFER: u64 = 0x1_0000;
/// Physical address backing [`BUFFER`].
pub const BUFFER_PA: u64 = 0x50_0000;

const VMCALL: u32 = 18;

/// Every processor of a simulated machine, with a notion of which one the
/// calling thread is pinned to.
pub struct LocalGateway {
    hv: Hypervisor<SimulatedPlatform>,
    cr3: u64,
    current: Cell<usize>,
}

impl LocalGateway {
    pub fn new(vcpus: usize) -> Self {
        let platform = SimulatedPlatform::new(16 << 20);
        let cr3 = {
            let mut b = GuestPageTableBuilder::new(&platform, 0x300..0x340);
            for i in 0..IMAGE_MAPPED_PAGES {
                b.map_page(
                    IMAGE_BASE + i * 0x1000,
                    Pa::from_pfn(IMAGE_PFN + i).unwrap(),
                );
            }
            for i in 0..4 {
                b.map_page(BUFFER + i * 0x1000, Pa::new(BUFFER_PA + i * 0x1000).unwrap());
            }
            b.cr3()
        };
        let hv = Hypervisor::start(
            platform,
            HypervisorConfig {
                vcpu_count: vcpus,
                system_cr3: cr3,
                image_base: IMAGE_BASE,
                image_size: IMAGE_SIZE,
                introspection: None,
            },
        )
        .unwrap();
        Self {
            hv,
            cr3,
            current: Cell::new(0),
        }
    }

    pub fn hv(&self) -> &Hypervisor<SimulatedPlatform> {
        &self.hv
    }

    /// CR3 of the System address space, which is also the caller's.
    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn current(&self) -> usize {
        self.current.get()
    }

    /// Read `buf.len()` bytes of `gpa` the way processor `cpu` sees them.
    pub fn guest_read(&self, cpu: usize, gpa: u64, access: Permission, buf: &mut [u8]) {
        self.hv
            .with_vcpu(cpu, |v| {
                guest_read(&v.ept, self.hv.platform(), Gpa::new(gpa).unwrap(), access, buf)
            })
            .unwrap()
            .unwrap();
    }
}

impl Hypercaller for LocalGateway {
    fn vmcall(&self, input: &HypercallInput) -> Result<u64, NotVirtualized> {
        let cpu = self.current.get();
        if !self.hv.is_virtualized(cpu) {
            return Err(NotVirtualized);
        }
        let mut guest = GuestState::new(self.cr3);
        let [rcx, rdx, r8, r9, r10, r11] = input.args;
        guest.regs.rax = input.to_rax();
        guest.regs.rcx = rcx;
        guest.regs.rdx = rdx;
        guest.regs.r8 = r8;
        guest.regs.r9 = r9;
        guest.regs.r10 = r10;
        guest.regs.r11 = r11;
        let exit = VmExit::new(VMCALL, 0, 0, 3).unwrap();
        self.hv.handle_vmexit(cpu, &exit, &mut guest).unwrap();
        Ok(guest.regs.rax)
    }
}

impl Processors for LocalGateway {
    fn count(&self) -> usize {
        self.hv.vcpu_count()
    }

    fn run_on(&self, cpu: usize, f: &mut dyn FnMut()) {
        let previous = self.current.replace(cpu);
        f();
        self.current.set(previous);
    }
}

type Alarm<'a> = (u64, Box<dyn FnMut(u64) + 'a>);

/// A clock that only moves when someone sleeps on it. Alarms fire once the
/// time they were set for has passed.
pub struct ManualClock<'a> {
    now: Cell<u64>,
    alarms: RefCell<Vec<Alarm<'a>>>,
}

impl<'a> ManualClock<'a> {
    pub fn new(start: u64) -> Self {
        Self {
            now: Cell::new(start),
            alarms: RefCell::new(Vec::new()),
        }
    }

    /// Run `f` with the current time once the clock reaches `time`.
    pub fn at(&self, time: u64, f: impl FnMut(u64) + 'a) {
        self.alarms.borrow_mut().push((time, Box::new(f)));
    }
}

impl<'a> Clock for ManualClock<'a> {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        let now = self.now.get() + ms;
        self.now.set(now);
        let due: Vec<Alarm<'a>> = {
            let mut alarms = self.alarms.borrow_mut();
            let (due, rest): (Vec<_>, Vec<_>) =
                alarms.drain(..).partition(|(time, _)| *time <= now);
            *alarms = rest;
            due
        };
        for (_, mut f) in due {
            f(now);
        }
    }
}
