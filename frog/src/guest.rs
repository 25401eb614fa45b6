//! Guest memory access from root mode.
//!
//! Guest virtual addresses are translated by walking the guest's own 4-level
//! page tables in physical memory. The walk honours 1 GiB and 2 MiB pages and
//! ignores access rights: root mode may read what the guest itself may not.
//!
//! Copies go one page at a time through a bounce buffer, since neither side
//! is guaranteed to be contiguous in physical memory. A copy stops at the
//! first page that is not present on either side and reports how far it got.
use crate::{
    config::{IntrospectionConfig, MAX_PROCESS_WALK, SYSTEM_PID},
    platform::Platform,
};
use abyss::{
    addressing::{Pa, Va, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE},
    paging::{Pde, Pdpe, Pml4e, Pte},
    x86_64::CR3_PFN_MASK,
};

/// A translated guest virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address.
    pub pa: Pa,
    /// Bytes from `pa` to the end of its page.
    pub remaining: u64,
}

fn entry<P: Platform>(platform: &P, table: Pa, index: usize) -> Option<u64> {
    platform.read_u64(table + index as u64 * 8).ok()
}

fn leaf(frame: Pa, page_size: u64, va: Va) -> Translation {
    let offset = va.into_u64() & (page_size - 1);
    Translation {
        pa: Pa::new(frame.into_u64() & !(page_size - 1)).unwrap_or(Pa::ZERO) + offset,
        remaining: page_size - offset,
    }
}

/// Translate `gva` in the address space rooted at `cr3`.
pub fn translate<P: Platform>(platform: &P, cr3: u64, gva: u64) -> Option<Translation> {
    let va = Va::new(gva)?;
    let pml4 = Pa::new(cr3 & CR3_PFN_MASK)?;

    let pml4e = Pml4e(entry(platform, pml4, va.pml4_index())?);
    let pdpe = Pdpe(entry(platform, pml4e.pa()?, va.pdpt_index())?);
    if pdpe.is_huge() {
        return Some(leaf(pdpe.pa()?, HUGE_PAGE_SIZE, va));
    }
    let pde = Pde(entry(platform, pdpe.pa()?, va.pd_index())?);
    if pde.is_large() {
        return Some(leaf(pde.pa()?, LARGE_PAGE_SIZE, va));
    }
    let pte = Pte(entry(platform, pde.pa()?, va.pt_index())?);
    Some(leaf(pte.pa()?, PAGE_SIZE, va))
}

/// Physical address of `gva` in the address space rooted at `cr3`.
pub fn physical_address<P: Platform>(platform: &P, cr3: u64, gva: u64) -> Option<Pa> {
    translate(platform, cr3, gva).map(|t| t.pa)
}

/// One side of a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Physical memory.
    Physical(Pa),
    /// Virtual memory of the address space rooted at `cr3`.
    Virtual {
        /// Address space.
        cr3: u64,
        /// First byte.
        gva: u64,
    },
}

impl Endpoint {
    fn at<P: Platform>(&self, platform: &P, offset: u64) -> Option<Translation> {
        match *self {
            Self::Physical(pa) => {
                let pa = Pa::new(pa.into_u64().checked_add(offset)?)?;
                Some(Translation {
                    pa,
                    remaining: PAGE_SIZE - pa.page_offset(),
                })
            }
            Self::Virtual { cr3, gva } => translate(platform, cr3, gva.checked_add(offset)?),
        }
    }
}

/// Copy `size` bytes from `src` to `dst`. Returns the bytes copied.
pub fn copy<P: Platform>(platform: &P, dst: Endpoint, src: Endpoint, size: u64) -> u64 {
    let mut bounce = [0u8; PAGE_SIZE as usize];
    let mut copied = 0;
    while copied < size {
        let (d, s) = match (dst.at(platform, copied), src.at(platform, copied)) {
            (Some(d), Some(s)) => (d, s),
            _ => break,
        };
        let chunk = (size - copied).min(d.remaining).min(s.remaining) as usize;
        let buf = &mut bounce[..chunk];
        if platform.read_physical(s.pa, buf).is_err()
            || platform.write_physical(d.pa, buf).is_err()
        {
            break;
        }
        copied += chunk as u64;
    }
    copied
}

/// Copy `bytes` from hypervisor memory to `dst`. Returns the bytes copied.
pub fn write_bytes<P: Platform>(platform: &P, dst: Endpoint, bytes: &[u8]) -> u64 {
    let mut copied = 0;
    while copied < bytes.len() {
        let d = match dst.at(platform, copied as u64) {
            Some(d) => d,
            None => break,
        };
        let n = (bytes.len() - copied).min(d.remaining as usize);
        if platform.write_physical(d.pa, &bytes[copied..copied + n]).is_err() {
            break;
        }
        copied += n;
    }
    copied as u64
}

/// Read a `u64` of the address space rooted at `cr3`.
pub fn read_u64<P: Platform>(platform: &P, cr3: u64, gva: u64) -> Option<u64> {
    let mut b = [0u8; 8];
    let mut copied = 0;
    while copied < b.len() {
        let t = translate(platform, cr3, gva.checked_add(copied as u64)?)?;
        let n = (b.len() - copied).min(t.remaining as usize);
        platform.read_physical(t.pa, &mut b[copied..copied + n]).ok()?;
        copied += n;
    }
    Some(u64::from_le_bytes(b))
}

/// Kernel CR3 of process `pid`.
///
/// The System process is answered directly. Any other process is searched
/// for on the kernel's active process list, starting at the System process.
pub fn query_process_cr3<P: Platform>(
    platform: &P,
    system_cr3: u64,
    introspection: Option<&IntrospectionConfig>,
    pid: u64,
) -> Option<u64> {
    if pid == SYSTEM_PID {
        return Some(system_cr3);
    }
    let layout = introspection?;
    let links = layout.active_process_links_offset();
    let head = layout.system_eprocess.wrapping_add(links);
    let mut current = head;
    for _ in 0..MAX_PROCESS_WALK {
        // Flink is the first field of a list entry.
        current = read_u64(platform, system_cr3, current)?;
        let process = current.wrapping_sub(links);
        let id = read_u64(
            platform,
            system_cr3,
            process.wrapping_add(layout.unique_process_id_offset),
        )?;
        if id == pid {
            return read_u64(
                platform,
                system_cr3,
                process.wrapping_add(layout.directory_table_base_offset),
            );
        }
        if current == head {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{GuestPageTableBuilder, SimulatedPlatform};

    const KERNEL: u64 = 0xffff_8000_0000_0000;

    fn setup() -> (SimulatedPlatform, u64) {
        let p = SimulatedPlatform::new(16 << 20);
        let cr3 = {
            let mut b = GuestPageTableBuilder::new(&p, 0x100..0x200);
            b.map_page(0x1000, Pa::new(0x40_0000).unwrap());
            b.map_page(0x2000, Pa::new(0x50_0000).unwrap());
            // 0x3000 is left unmapped.
            b.map_page(0x4000, Pa::new(0x60_0000).unwrap());
            b.map_large(0x20_0000, Pa::new(0x80_0000).unwrap());
            b.map_huge(0x4000_0000, Pa::ZERO);
            b.map_page(KERNEL, Pa::new(0x70_0000).unwrap());
            b.cr3()
        };
        (p, cr3)
    }

    #[test]
    fn walk_page_sizes() {
        let (p, cr3) = setup();
        assert_eq!(
            translate(&p, cr3, 0x1234),
            Some(Translation {
                pa: Pa::new(0x40_0234).unwrap(),
                remaining: 0xdcc
            })
        );
        assert_eq!(
            translate(&p, cr3, 0x21_2345).map(|t| t.pa.into_u64()),
            Some(0x81_2345)
        );
        assert_eq!(
            translate(&p, cr3, 0x4012_3456).map(|t| (t.pa.into_u64(), t.remaining)),
            Some((0x12_3456, HUGE_PAGE_SIZE - 0x12_3456))
        );
        assert_eq!(physical_address(&p, cr3, KERNEL + 8).map(Pa::into_u64), Some(0x70_0008));
        assert_eq!(translate(&p, cr3, 0x3000), None);
        assert_eq!(translate(&p, cr3, 0x8000_0000_0000), None);
    }

    #[test]
    fn copy_across_pages() {
        let (p, cr3) = setup();
        let data: Vec<u8> = (0..0x1800u32).map(|i| i as u8).collect();
        p.write_physical(Pa::new(0x40_0800).unwrap(), &data[..0x800]).unwrap();
        p.write_physical(Pa::new(0x50_0000).unwrap(), &data[0x800..]).unwrap();

        let n = copy(
            &p,
            Endpoint::Physical(Pa::new(0x90_0000).unwrap()),
            Endpoint::Virtual { cr3, gva: 0x1800 },
            0x1800,
        );
        assert_eq!(n, 0x1800);
        let mut out = vec![0; 0x1800];
        p.read_physical(Pa::new(0x90_0000).unwrap(), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn copy_stops_at_hole() {
        let (p, cr3) = setup();
        let n = copy(
            &p,
            Endpoint::Virtual { cr3, gva: 0x2800 },
            Endpoint::Physical(Pa::new(0x90_0000).unwrap()),
            0x2000,
        );
        assert_eq!(n, 0x800);
        assert_eq!(
            copy(
                &p,
                Endpoint::Physical(Pa::new(0x90_0000).unwrap()),
                Endpoint::Virtual { cr3, gva: 0x3000 },
                8
            ),
            0
        );
    }

    #[test]
    fn process_walk() {
        let (p, cr3) = setup();
        let layout = IntrospectionConfig {
            system_eprocess: KERNEL,
            unique_process_id_offset: 0x40,
            directory_table_base_offset: 0x28,
        };
        let links = layout.active_process_links_offset();
        // Three processes on one page: System at 0, pid 100 at 0x200, pid 200 at 0x400.
        let processes = [(0u64, 4u64, cr3), (0x200, 100, 0x1000), (0x400, 200, 0x2000)];
        for (i, (offset, pid, dtb)) in processes.iter().enumerate() {
            let (next, _, _) = processes[(i + 1) % processes.len()];
            let base = 0x70_0000 + offset;
            p.write_physical(Pa::new(base + 0x40).unwrap(), &pid.to_le_bytes()).unwrap();
            p.write_physical(Pa::new(base + 0x28).unwrap(), &dtb.to_le_bytes()).unwrap();
            p.write_physical(Pa::new(base + links).unwrap(), &(KERNEL + next + links).to_le_bytes())
                .unwrap();
        }

        assert_eq!(query_process_cr3(&p, cr3, Some(&layout), 4), Some(cr3));
        assert_eq!(query_process_cr3(&p, cr3, Some(&layout), 100), Some(0x1000));
        assert_eq!(query_process_cr3(&p, cr3, Some(&layout), 200), Some(0x2000));
        assert_eq!(query_process_cr3(&p, cr3, Some(&layout), 300), None);
        assert_eq!(query_process_cr3(&p, cr3, None, 100), None);
        assert_eq!(query_process_cr3(&p, cr3, None, 4), Some(cr3));
    }
}
