use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, SocketAddrV4},
    time::{Duration, Instant},
};

use pnet::packet::icmp::IcmpTypes;
use socket2::Socket;

use crate::error::ScanError;

use super::{
    check_ports, check_timeout,
    engine::{self, Driver, Interest, Source},
    ledger::Ledger,
    pckt, socket, OpenPort, Transport,
};

const UDP_TOKEN: usize = 0;
const ICMP_TOKEN: usize = 1;
const RECV_BUF_SZ: usize = 1500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpReport {
    /// Neither a reply nor an ICMP unreachable arrived: open or filtered.
    pub no_response: Vec<u16>,
    pub open: Vec<OpenPort>,
    pub closed: Vec<u16>,
}

impl UdpReport {
    /// Silent ports as `(port, rtt_ms)` pairs, the shape `open` has. The
    /// time is always 0 since nothing was measured.
    pub fn no_definite_response(&self) -> Vec<(u16, u64)> {
        self.no_response.iter().map(|&port| (port, 0)).collect()
    }
}

/// UDP scan: empty datagrams out, replies on the UDP socket and port
/// unreachable errors on a raw ICMP socket.
pub struct UdpScanner<U: Transport = Socket, I: Transport = Socket> {
    target: Ipv4Addr,
    udp: U,
    icmp: I,
    requested: HashSet<u16>,
    queue: Vec<u16>,
    ledger: Ledger,
    open: Vec<OpenPort>,
    closed: HashSet<u16>,
}

impl UdpScanner<Socket, Socket> {
    /// Opens the raw ICMP socket, which requires root privileges.
    pub fn new(target: Ipv4Addr, ports: HashSet<u16>, timeout: f64) -> Result<Self, ScanError> {
        check_ports(&ports)?;
        check_timeout(timeout)?;

        let icmp = socket::raw_icmp()?;
        let udp = socket::udp()?;

        Self::with_transport(target, ports, timeout, udp, icmp)
    }
}

impl<U: Transport, I: Transport> UdpScanner<U, I> {
    pub fn with_transport(
        target: Ipv4Addr,
        ports: HashSet<u16>,
        timeout: f64,
        udp: U,
        icmp: I,
    ) -> Result<Self, ScanError> {
        check_ports(&ports)?;
        let ttl = check_timeout(timeout)?;

        Ok(Self {
            target,
            udp,
            icmp,
            queue: ports.iter().copied().collect(),
            requested: ports,
            ledger: Ledger::new(ttl),
            open: Vec::new(),
            closed: HashSet::new(),
        })
    }

    pub fn scan(self) -> Result<UdpReport, ScanError> {
        log::debug!(
            "Starting UDP scan of {} port(s) on `{}` (timeout {:?})",
            self.queue.len(),
            self.target,
            self.ledger.ttl()
        );

        let report = engine::run(self)?;

        log::debug!(
            "UDP scan found {} open, {} closed and {} silent port(s)",
            report.open.len(),
            report.closed.len(),
            report.no_response.len()
        );

        Ok(report)
    }

    /// The reply's source port names the probed port.
    fn handle_datagram(&mut self, from: SocketAddrV4, received: Instant) {
        let port = from.port();
        let Some(sent) = self.ledger.remove_at(port, received) else {
            return;
        };

        let rtt = received.saturating_duration_since(sent);
        log::debug!("Port {} is open ({:?})", port, rtt);
        self.open.push(OpenPort::new(port, rtt));
    }

    fn handle_icmp(&mut self, data: &[u8], received: Instant) {
        let port = match pckt::icmp_type(data) {
            Ok(kind) if kind == IcmpTypes::DestinationUnreachable.0 => {
                match pckt::icmp_embedded_destination_port(data) {
                    Ok(port) => port,
                    Err(e) => {
                        log::debug!("Discarding ICMP message from `{}`: {}", self.target, e);
                        return;
                    }
                }
            }
            Ok(_) => return,
            Err(e) => {
                log::debug!("Discarding ICMP message from `{}`: {}", self.target, e);
                return;
            }
        };

        if self.ledger.remove_at(port, received).is_some() {
            log::debug!("Port {} is closed", port);
            self.closed.insert(port);
        }
    }

    fn recv<T: Transport>(
        target: Ipv4Addr,
        socket: &T,
        buf: &mut [u8],
    ) -> Option<(usize, SocketAddrV4)> {
        match socket.recv_from(buf) {
            Ok((n, from)) if *from.ip() == target => Some((n, from)),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::debug!("{}", ScanError::PacketRecvFailed(target.into(), e));
                None
            }
        }
    }
}

impl<U: Transport, I: Transport> Driver for UdpScanner<U, I> {
    type Output = UdpReport;

    fn sources(&self) -> Vec<Source> {
        // Indexed by UDP_TOKEN and ICMP_TOKEN.
        vec![
            Source::new(self.udp.as_raw_fd(), Interest::ReadWrite),
            Source::new(self.icmp.as_raw_fd(), Interest::Read),
        ]
    }

    fn on_readable(&mut self, token: usize) {
        let mut buf = [0; RECV_BUF_SZ];

        match token {
            UDP_TOKEN => {
                if let Some((_, from)) = Self::recv(self.target, &self.udp, &mut buf) {
                    self.handle_datagram(from, Instant::now());
                }
            }
            ICMP_TOKEN => {
                if let Some((n, _)) = Self::recv(self.target, &self.icmp, &mut buf) {
                    self.handle_icmp(&buf[..n], Instant::now());
                }
            }
            _ => unreachable!(),
        }
    }

    fn on_writable(&mut self, token: usize) {
        debug_assert_eq!(token, UDP_TOKEN);

        let Some(port) = self.queue.pop() else {
            return;
        };

        match self.udp.send_to(&[], SocketAddrV4::new(self.target, port)) {
            Ok(_) => {
                self.ledger.put(port, Instant::now());
                log::debug!("Sent UDP probe to port {}", port);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue.push(port);
            }
            Err(e) => {
                log::debug!("{}", ScanError::PacketSendFailed(self.target.into(), e));
            }
        }
    }

    fn is_complete(&mut self) -> bool {
        self.queue.is_empty() && self.ledger.is_empty()
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        self.ledger.next_expiry()
    }

    fn finish(mut self) -> UdpReport {
        self.ledger.destroy();

        let answered = self.open.iter().map(|o| o.port).collect::<HashSet<_>>();
        let mut no_response = self
            .requested
            .iter()
            .filter(|port| !self.closed.contains(port) && !answered.contains(port))
            .copied()
            .collect::<Vec<_>>();
        no_response.sort_unstable();

        let mut closed = self.closed.into_iter().collect::<Vec<_>>();
        closed.sort_unstable();

        self.open.sort_unstable();

        UdpReport {
            no_response,
            open: self.open,
            closed,
        }
    }
}
