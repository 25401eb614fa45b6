//! Hypercall handlers, one per [`frog_abi::HypercallCode`].
use super::HypercallCtx;
use crate::{
    config::EPT_SPLIT_POOL_PAGES,
    ept::{EptError, EptFlush, MmrHandle},
    guest::{self, Endpoint},
    mailbox::Message,
    platform::Platform,
};
use abyss::addressing::{Gpa, Pa};
use frog_abi::{LogRecord, MmrMode, HYPERCALL_FAILURE, HYPERVISOR_SIGNATURE};

const SUCCESS: u64 = 1;

impl<P: Platform> HypercallCtx<'_, P> {
    /// The caller's own address space.
    fn caller(&self, gva: u64) -> Endpoint {
        Endpoint::Virtual {
            cr3: self.guest.cr3,
            gva,
        }
    }

    /// `cr3`, or the System address space if it is zero.
    fn address_space(&self, cr3: u64) -> u64 {
        if cr3 == 0 {
            self.hv.config().system_cr3
        } else {
            cr3
        }
    }

    /// Apply an EPT change and report it in band.
    fn commit(&self, result: Result<EptFlush, EptError>, what: &str) -> u64 {
        match result {
            Ok(flush) => {
                flush.flush(self.hv.platform());
                SUCCESS
            }
            Err(e) => {
                debug!(self.hv, self.cpu, "{} failed: {:?}", what, e);
                HYPERCALL_FAILURE
            }
        }
    }
}

pub(super) fn ping<P: Platform>(_: &mut HypercallCtx<'_, P>) -> u64 {
    HYPERVISOR_SIGNATURE
}

pub(super) fn test<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let (hv, cpu) = (ctx.hv, ctx.cpu);
    let ept = &ctx.vcpu.ept;
    info!(hv, cpu, "IMAGEBASE:      {:#x}.", hv.config().image_base);
    info!(hv, cpu, "PROCESSOR:      {}.", cpu);
    info!(hv, cpu, "CPL:            {}.", ctx.guest.cpl as u8);
    info!(hv, cpu, "EPT USED PAGES: {} / {}.", ept.used_pages(), EPT_SPLIT_POOL_PAGES);
    info!(hv, cpu, "EPT HOOKS:      {}.", ept.hooks().count());
    info!(hv, cpu, "EPT MMRS:       {}.", ept.mmrs().count());
    SUCCESS
}

pub(super) fn unload<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.vcpu.stop_virtualization = true;
    SUCCESS
}

pub(super) fn read_phys_mem<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [dst, src, size, ..] = ctx.args;
    match Pa::new(src) {
        Some(src) => guest::copy(ctx.hv.platform(), ctx.caller(dst), Endpoint::Physical(src), size),
        None => 0,
    }
}

pub(super) fn write_phys_mem<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [dst, src, size, ..] = ctx.args;
    match Pa::new(dst) {
        Some(dst) => guest::copy(ctx.hv.platform(), Endpoint::Physical(dst), ctx.caller(src), size),
        None => 0,
    }
}

pub(super) fn read_virt_mem<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [cr3, dst, src, size, ..] = ctx.args;
    let target = Endpoint::Virtual {
        cr3: ctx.address_space(cr3),
        gva: src,
    };
    guest::copy(ctx.hv.platform(), ctx.caller(dst), target, size)
}

pub(super) fn write_virt_mem<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [cr3, dst, src, size, ..] = ctx.args;
    let target = Endpoint::Virtual {
        cr3: ctx.address_space(cr3),
        gva: dst,
    };
    guest::copy(ctx.hv.platform(), target, ctx.caller(src), size)
}

pub(super) fn query_process_cr3<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let config = ctx.hv.config();
    guest::query_process_cr3(
        ctx.hv.platform(),
        config.system_cr3,
        config.introspection.as_ref(),
        ctx.args[0],
    )
    .unwrap_or(HYPERCALL_FAILURE)
}

pub(super) fn install_ept_hook<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [orig, exec, ..] = ctx.args;
    let result = ctx.vcpu.ept.install_hook(orig, exec);
    ctx.commit(result, "install_ept_hook")
}

pub(super) fn remove_ept_hook<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let result = ctx.vcpu.ept.remove_hook(ctx.args[0]);
    ctx.commit(result, "remove_ept_hook")
}

/// Drain up to `count` records into the caller's buffer, oldest first.
///
/// A record is taken off the ring only once its slot in the buffer is known
/// to be mapped.
pub(super) fn flush_logs<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let count = ctx.args[0] as u32 as u64;
    let buffer = ctx.args[1];
    let platform = ctx.hv.platform();
    let size = LogRecord::SIZE as u64;

    let mut flushed = 0;
    while flushed < count {
        let slot = match buffer.checked_add(flushed * size) {
            Some(slot) => slot,
            None => break,
        };
        let last = slot.wrapping_add(size - 1);
        let mapped = [slot, last]
            .iter()
            .all(|&gva| guest::translate(platform, ctx.guest.cr3, gva).is_some());
        if !mapped {
            break;
        }
        let record = match ctx.hv.logger().pop() {
            Some(record) => record,
            None => break,
        };
        if guest::write_bytes(platform, ctx.caller(slot), &record.to_bytes()) != size {
            break;
        }
        flushed += 1;
    }
    flushed
}

pub(super) fn get_physical_address<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [cr3, gva, ..] = ctx.args;
    guest::physical_address(ctx.hv.platform(), ctx.address_space(cr3), gva)
        .map_or(HYPERCALL_FAILURE, Pa::into_u64)
}

pub(super) fn hide_physical_page<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let result = ctx.vcpu.ept.hide_page(ctx.args[0]);
    ctx.commit(result, "hide_physical_page")
}

pub(super) fn unhide_physical_page<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let result = ctx.vcpu.ept.unhide_page(ctx.args[0]);
    ctx.commit(result, "unhide_physical_page")
}

pub(super) fn get_hv_base<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.hv.config().image_base
}

pub(super) fn install_mmr<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [address, size, mode, ..] = ctx.args;
    let mode = MmrMode::from_bits_truncate((mode & 0b111) as u8);
    let start = match Gpa::new(address) {
        Some(start) => start,
        None => return HYPERCALL_FAILURE,
    };
    match ctx.vcpu.ept.install_mmr(start, size as u32 as u64, mode) {
        Ok((handle, flush)) => {
            flush.flush(ctx.hv.platform());
            handle.into_raw()
        }
        Err(e) => {
            debug!(ctx.hv, ctx.cpu, "install_mmr failed: {:?}", e);
            HYPERCALL_FAILURE
        }
    }
}

pub(super) fn remove_mmr<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let result = ctx.vcpu.ept.remove_mmr(MmrHandle::from_raw(ctx.args[0]));
    ctx.commit(result, "remove_mmr")
}

pub(super) fn remove_all_mmrs<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let result = ctx.vcpu.ept.remove_all_mmrs().map(|(_, flush)| flush);
    ctx.commit(result, "remove_all_mmrs")
}

pub(super) fn send_message<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    let [content, kind, time, sender, ..] = ctx.args;
    ctx.hv.mailbox().send(Message {
        content,
        kind,
        time,
        sender,
    });
    SUCCESS
}

pub(super) fn get_message<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.hv.mailbox().content()
}

pub(super) fn get_message_type<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.hv.mailbox().kind()
}

pub(super) fn get_message_time<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.hv.mailbox().time()
}

pub(super) fn get_message_sender<P: Platform>(ctx: &mut HypercallCtx<'_, P>) -> u64 {
    ctx.hv.mailbox().sender()
}
