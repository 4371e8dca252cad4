//! CGNAT address classification. 100.64.0.0/10 is the private range the
//! overlay hands out, so an address in it marks a peer-reachable device.

use std::net::{IpAddr, Ipv4Addr};

/// True for IPv4 addresses in 100.64.0.0/10.
pub fn is_cgnat(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 100 && (o[1] & 0xC0) == 64
}

/// Classify a general address: only IPv4 in the CGNAT block qualifies.
pub fn is_cgnat_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_cgnat(v4),
        IpAddr::V6(_) => false,
    }
}
