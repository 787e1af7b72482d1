use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use once_cell::sync::OnceCell;
use pnet::{datalink::interfaces, ipnetwork::IpNetwork};

use crate::error::ScanError;

/// Well-known host used to learn which local address routes outwards.
const PROBE_HOST: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);

static SOURCE: OnceCell<Ipv4Addr> = OnceCell::new();

fn from_interfaces() -> Option<Ipv4Addr> {
    interfaces()
        .into_iter()
        .filter(|e| e.is_up() && !e.is_loopback())
        .find_map(|e| {
            e.ips.iter().find_map(|ip| match ip {
                IpNetwork::V4(ipnet) if !ipnet.ip().is_loopback() => {
                    log::debug!("Using network interface `{}` with IPv4 `{}`", e.name, ipnet.ip());
                    Some(ipnet.ip())
                }
                _ => None,
            })
        })
}

fn from_route() -> Option<Ipv4Addr> {
    // Connecting a datagram socket sends nothing, it only picks a route.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(PROBE_HOST).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => {
            log::debug!("Using IPv4 `{}` routed towards `{}`", ip, PROBE_HOST.0);
            Some(ip)
        }
        _ => None,
    }
}

/// Local IPv4 the probes are sent from, resolved once per process.
pub fn source_addr() -> Result<Ipv4Addr, ScanError> {
    SOURCE
        .get_or_try_init(|| {
            from_interfaces()
                .or_else(from_route)
                .ok_or(ScanError::MissingSourceAddr)
        })
        .copied()
}
