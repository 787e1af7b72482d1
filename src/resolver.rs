use std::{
    ffi::CStr,
    mem,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    ptr,
};

use url::Host;

use crate::error::ScanError;

/// Turns the scan target into the single IPv4 address that gets probed.
pub fn lookup(target: &str) -> Result<Ipv4Addr, ScanError> {
    let ip = match Host::parse(target).map_err(ScanError::HostParseFailed)? {
        Host::Domain(dmn) => (dmn, 0 /* dummy port */)
            .to_socket_addrs()
            .map_err(ScanError::ResolverFailed)?
            .find_map(|saddr| match saddr {
                SocketAddr::V4(sip) => Some(*sip.ip()),
                SocketAddr::V6(_) => None,
            })
            .ok_or(ScanError::DomainLookupFailed(target.into()))?,
        Host::Ipv4(ip) => ip,
        Host::Ipv6(_) => Err(ScanError::OnlyIpv4TargetSupported)?,
    };

    log::debug!("Scanning IPv4 `{}` for target `{}`", ip, target);

    Ok(ip)
}

const NI_MAXHOST: usize = 1025;

/// Name registered for `ip` in reverse DNS (or the hosts file), if any.
pub fn reverse(ip: Ipv4Addr) -> Option<String> {
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    };
    let mut host = [0 as libc::c_char; NI_MAXHOST];

    // SAFETY: `addr` is a valid sockaddr_in of the advertised length and
    // `host` is writable for its whole length. No service buffer is passed.
    let rc = unsafe {
        libc::getnameinfo(
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        log::debug!("No reverse name for `{}` (getnameinfo error {})", ip, rc);
        return None;
    }

    // SAFETY: on success getnameinfo leaves a NUL terminated string in `host`.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    Some(name)
}
