use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Result};
use log::debug;
use pnet::datalink::{self, NetworkInterface};
use rand::{thread_rng, Rng};

/// First usable IPv4 address of an interface: not loopback, link-local or
/// multicast.
fn usable_ipv4(interface: &NetworkInterface) -> Option<Ipv4Addr> {
    interface.ips.iter().find_map(|network| match network.ip() {
        IpAddr::V4(ipv4) if !ipv4.is_loopback() && !ipv4.is_link_local() && !ipv4.is_multicast() => Some(ipv4),
        _ => None,
    })
}

/// Pick the probe source address automatically.
///
/// Walks the interfaces in system order, skipping loopback, and returns the
/// first one carrying a usable IPv4 address together with its name.
pub fn get_default_interface_ipv4() -> Result<(String, Ipv4Addr)> {
    for interface in datalink::interfaces() {
        if interface.is_loopback() {
            continue;
        }

        if let Some(ipv4) = usable_ipv4(&interface) {
            debug!("Found IPv4 address: {} on interface {}", ipv4, interface.name);
            return Ok((interface.name, ipv4));
        }
    }

    Err(anyhow!("Could not decide which network interface to use. Specify it with -i <iface>"))
}

/// IPv4 address of the interface called `name`
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|interface| interface.name == name)
        .ok_or_else(|| anyhow!("No network interface named {}", name))?;

    // Loopback is allowed when asked for by name
    interface
        .ips
        .iter()
        .find_map(|network| match network.ip() {
            IpAddr::V4(ipv4) => Some(ipv4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("Interface {} has no IPv4 address (IPv6 is not supported)", name))
}

/// Generate a random TCP sequence number
pub fn random_tcp_seq() -> u32 {
    thread_rng().gen::<u32>()
}

/// Generate a random 64-bit MPTCP key
pub fn random_sender_key() -> u64 {
    thread_rng().gen::<u64>()
}

/// Raw sockets need an effective uid of 0
pub fn has_raw_socket_privileges() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    {
        false
    }
}
