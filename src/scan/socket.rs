use std::{
    io,
    mem::MaybeUninit,
    net::{Ipv4Addr, SocketAddrV4},
    os::fd::AsRawFd,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::ScanError;

/// Datagram endpoint the scanners probe through.
///
/// Raw sockets report the sender with port 0, datagram sockets with the
/// port the reply came from.
pub trait Transport: AsRawFd {
    fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;
}

impl Transport for Socket {
    fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        Socket::send_to(self, buf, &SockAddr::from(dest))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        // SAFETY: `recv_from` only ever writes initialized bytes into the
        // buffer, and `u8` and `MaybeUninit<u8>` share the same layout.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, from) = Socket::recv_from(self, uninit)?;
        let from = from
            .as_socket_ipv4()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non IPv4 sender"))?;
        Ok((n, from))
    }
}

fn open(ty: Type, proto: Protocol) -> Result<Socket, ScanError> {
    let socket = Socket::new(Domain::IPV4, ty, Some(proto)).map_err(ScanError::from_socket)?;
    socket
        .set_nonblocking(true)
        .map_err(ScanError::SocketFailed)?;
    Ok(socket)
}

/// Raw TCP socket bound to `source`, so the kernel stamps the same address
/// the pseudo-header checksum was computed with. The kernel prepends the
/// IPv4 header on send and keeps it on receive.
pub fn raw_tcp(source: Ipv4Addr) -> Result<Socket, ScanError> {
    let socket = open(Type::RAW, Protocol::TCP)?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(source, 0)))
        .map_err(ScanError::SocketFailed)?;
    log::debug!("Opened raw TCP socket (fd {})", socket.as_raw_fd());
    Ok(socket)
}

pub fn raw_icmp() -> Result<Socket, ScanError> {
    let socket = open(Type::RAW, Protocol::ICMPV4)?;
    log::debug!("Opened raw ICMP socket (fd {})", socket.as_raw_fd());
    Ok(socket)
}

pub fn udp() -> Result<Socket, ScanError> {
    let socket = open(Type::DGRAM, Protocol::UDP)?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
        .map_err(ScanError::SocketFailed)?;
    log::debug!("Opened UDP socket (fd {})", socket.as_raw_fd());
    Ok(socket)
}
