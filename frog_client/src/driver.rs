//! The load-state handshake between the driver and its clients.
//!
//! Once every processor is virtualized the driver posts
//! [`load_state::LOADED`] as a [`kind::LOAD_STATE`] message under the reserved
//! sender id [`sender::DRIVER`]. A client that starts later finds it in the
//! mailbox; one that starts earlier waits for it.
use crate::{
    client::Client,
    clock::Clock,
    cpu::{for_each_cpu, Processors},
    transport::Hypercaller,
};
use frog_abi::message::{kind, load_state, sender};

/// How long a client waits for the driver, in milliseconds.
pub const LOAD_WAIT_MS: u64 = 4096;

/// Post the load state `state` on behalf of the driver.
///
/// Returns `false` if `client` is not the driver's or the send failed.
pub fn announce<H: Hypercaller, C: Clock>(client: &Client<H, C>, state: u64) -> bool {
    client.sender() == sender::DRIVER && client.send_message(state, kind::LOAD_STATE)
}

/// Announce a successful load, after checking the hypervisor answers.
pub fn announce_loaded<H: Hypercaller, C: Clock>(client: &Client<H, C>) -> bool {
    client.is_hv_running() && announce(client, load_state::LOADED)
}

/// Announce the unload, then devirtualize every processor.
///
/// Returns the number of processors that accepted the unload.
pub fn unload_all<H, C, P>(client: &Client<H, C>, processors: &P) -> usize
where
    H: Hypercaller,
    C: Clock,
    P: Processors + ?Sized,
{
    announce(client, load_state::UNLOADING);
    let mut unloaded = 0;
    for_each_cpu(processors, |_| {
        if client.unload() != 0 {
            unloaded += 1;
        }
    });
    unloaded
}

/// Whether the driver reports the hypervisor as loaded, waiting up to
/// [`LOAD_WAIT_MS`] for its announcement.
pub fn wait_until_loaded<H: Hypercaller, C: Clock>(client: &Client<H, C>) -> bool {
    if client.get_message() == load_state::LOADED
        && client.get_message_type() == kind::LOAD_STATE
    {
        return true;
    }
    client.wait_for_message(LOAD_WAIT_MS, kind::LOAD_STATE) == load_state::LOADED
}
