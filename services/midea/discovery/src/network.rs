//! Broadcast targets from the host's interfaces.

use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Directed broadcast address of a private IPv4 network.
///
/// Host routes, public, loopback and link-local networks yield `None`.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Addr> {
    let mask = u32::from(netmask);
    if mask.count_ones() >= 32 {
        return None;
    }
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    let broadcast = Ipv4Addr::from(u32::from(ip) | !mask);
    let private = network.is_private() && broadcast.is_private();
    if !private || network.is_loopback() || network.is_link_local() {
        return None;
    }
    Some(broadcast)
}

/// Broadcast addresses of every eligible interface, without duplicates
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut addresses = Vec::new();
    for interface in interfaces {
        if let if_addrs::IfAddr::V4(v4) = &interface.addr {
            if let Some(broadcast) = broadcast_address(v4.ip, v4.netmask) {
                if !addresses.contains(&broadcast) {
                    debug!("Interface {} broadcasts to {}", interface.name, broadcast);
                    addresses.push(broadcast);
                }
            }
        }
    }
    addresses
}
