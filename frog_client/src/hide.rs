//! Hiding the hypervisor image from the guest.
use crate::{
    client::Client,
    clock::Clock,
    cpu::{for_each_cpu, Processors},
    transport::Hypercaller,
};
use abyss::addressing::PAGE_SIZE;

/// Outcome of [`hide_hypervisor`], summed over every processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HideReport {
    /// Pages hidden.
    pub hidden: usize,
    /// Pages of the image that had no physical address.
    pub unmapped: usize,
    /// Pages the hypervisor refused to hide.
    pub failed: usize,
}

/// Pages spanned by `image_size` bytes.
fn image_pages(image_size: u64) -> u64 {
    image_size / PAGE_SIZE + (image_size % PAGE_SIZE != 0) as u64
}

/// Hide every page of the `image_size` byte hypervisor image from every
/// processor.
///
/// The image base is asked from the hypervisor itself and each page is
/// translated through the System address space.
pub fn hide_hypervisor<H, C, P>(
    client: &Client<H, C>,
    processors: &P,
    image_size: u64,
) -> HideReport
where
    H: Hypercaller,
    C: Clock,
    P: Processors + ?Sized,
{
    let mut report = HideReport::default();
    let base = client.get_hv_base();
    if base == 0 {
        return report;
    }
    let pages = image_pages(image_size);
    for_each_cpu(processors, |_| {
        for page in 0..pages {
            let pa = client.get_physical_address(0, base.wrapping_add(page * PAGE_SIZE));
            if pa == 0 {
                report.unmapped += 1;
            } else if client.hide_physical_page(pa / PAGE_SIZE) {
                report.hidden += 1;
            } else {
                report.failed += 1;
            }
        }
    });
    report
}
