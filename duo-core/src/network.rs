//! Address admissibility: which IPs we dial, advertise, and accept from peers.

use std::net::{IpAddr, Ipv4Addr};

/// Overlay (CGNAT mesh) range: 100.64.0.0/10.
pub fn is_overlay_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (64..=127).contains(&o[1])
}

/// RFC 1918 private ranges.
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        10 => true,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        _ => false,
    }
}

/// Interface-name heuristic for VPN/tunnel adapters whose addresses should not be advertised.
pub fn is_tunnel_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["utun", "tun", "tap", "wg", "ppp", "ipsec", "tailscale", "zt"]
        .iter()
        .any(|p| name.starts_with(p))
}

fn parse_v4(ip: &str) -> Option<Ipv4Addr> {
    match ip.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Same-network check applied to dial candidates. Loopback is allowed for local testing.
pub fn is_dial_admissible(ip: &str, expanded_networking: bool) -> bool {
    if expanded_networking {
        return ip.trim().parse::<IpAddr>().is_ok();
    }
    match parse_v4(ip) {
        Some(v4) => v4.is_loopback() || is_private_ipv4(v4) || is_overlay_ipv4(v4),
        None => false,
    }
}

/// Whether a peer-advertised address may enter the peer table.
///
/// Overlay addresses need expanded networking or an overlay address of our own.
pub fn is_peer_ip_admissible(ip: &str, expanded_networking: bool, local_has_overlay: bool) -> bool {
    let Some(v4) = parse_v4(ip) else {
        return false;
    };
    if v4.is_unspecified() || v4.is_broadcast() || v4.is_multicast() {
        return false;
    }
    if is_overlay_ipv4(v4) {
        return expanded_networking || local_has_overlay;
    }
    true
}

/// Local address eligible for the presence datagram.
pub fn is_advertisable(interface: &str, ip: Ipv4Addr, expanded_networking: bool) -> bool {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
        return false;
    }
    if is_overlay_ipv4(ip) {
        return expanded_networking;
    }
    !is_tunnel_interface(interface)
}

/// Directed broadcast address, assuming a /24 subnet.
pub fn directed_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 255)
}
