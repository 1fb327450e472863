//! Local network address discovery

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::debug;

/// Address used to pick the outbound interface; nothing is sent to it
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Address other peers on the network can reach this machine at
///
/// Connects an unbound UDP socket toward a public address and reads back the
/// local address the OS chose. Falls back to loopback when the machine has no
/// route.
pub fn local_ip() -> IpAddr {
    match probe_local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            debug!("Local IP detection failed, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ip_never_unspecified() {
        // With or without a route we get a concrete address
        let ip = local_ip();
        assert!(!ip.is_unspecified());
    }
}
