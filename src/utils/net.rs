//! Local address resolution
//!
//! When the control endpoint binds a wildcard address, the advertised
//! address has to be resolved separately: a connectionless socket is
//! pointed at a well-known multicast address and the locally-chosen
//! source address read back. No packet is sent.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Multicast destination used for the routing probe
const PROBE_TARGET: &str = "224.0.1.41:7";

/// Best-effort local address for service advertisement
///
/// Falls back to the loopback address when no route can be determined.
pub fn local_ip() -> IpAddr {
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn probe() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(PROBE_TARGET).ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_unspecified() {
        None
    } else {
        Some(addr.ip())
    }
}
