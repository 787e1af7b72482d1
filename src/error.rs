use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("port `{0}` is invalid")]
    InvalidPort(String),
    #[error("timeout `{0}` is invalid (must be a positive number of seconds)")]
    InvalidTimeout(f64),
    #[error("failed to check target kind (ensure it's a domain or IPv4)")]
    HostParseFailed(#[source] url::ParseError),
    #[error("failed to resolve the given target: {0}")]
    ResolverFailed(#[source] std::io::Error),
    #[error("resolver didn't find any IPv4 address mapped by `{0}`")]
    DomainLookupFailed(String),
    #[error("only supports IPv4 addresses or domains that map addresses with this IP version")]
    OnlyIpv4TargetSupported,
    #[error("failed to find a local IPv4 address to scan from")]
    MissingSourceAddr,
    #[error("raw sockets require root privileges (try running with sudo)")]
    PermissionRequired(#[source] std::io::Error),
    #[error("failed to create socket: {0}")]
    SocketFailed(#[source] std::io::Error),
    #[error("host `{0}` seems down")]
    HostUnreachable(Ipv4Addr),
    #[error("malformed packet: expected at least {needed} bytes, got {got}")]
    MalformedPacket { needed: usize, got: usize },
    #[error("failed to send packet to `{0}`: {1}")]
    PacketSendFailed(IpAddr, #[source] std::io::Error),
    #[error("failed to receive packet from `{0}`: {1}")]
    PacketRecvFailed(IpAddr, #[source] std::io::Error),
    #[error("failed to wait for socket readiness: {0}")]
    PollFailed(#[source] std::io::Error),
    #[error("interrupted by user")]
    Interrupted,
}

impl ScanError {
    /// Maps a socket creation failure, telling privilege denials apart.
    pub(crate) fn from_socket(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => ScanError::PermissionRequired(e),
            _ if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ScanError::PermissionRequired(e)
            }
            _ => ScanError::SocketFailed(e),
        }
    }
}
