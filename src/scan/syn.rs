use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, SocketAddrV4},
    ops::Range,
    time::{Duration, Instant},
};

use pnet::packet::tcp::TcpFlags;
use rand::Rng;
use socket2::Socket;

use crate::{error::ScanError, interface};

use super::{
    check_ports, check_timeout,
    engine::{self, Driver, Interest, Source},
    ledger::Ledger,
    pckt, socket, OpenPort, Transport,
};

/// Ephemeral range the SYN probes are sent from.
const SRC_PORTS: Range<u16> = 35000..40000;
const RECV_BUF_SZ: usize = 1500;

/// TCP SYN scan over a single raw socket.
///
/// Open ports answer with SYN+ACK, closed ones with RST+ACK and filtered
/// ones stay silent until their probe expires. Only open ports are reported.
pub struct TcpScanner<T: Transport = Socket> {
    target: Ipv4Addr,
    source: Ipv4Addr,
    socket: T,
    queue: Vec<u16>,
    ledger: Ledger,
    open: Vec<OpenPort>,
}

impl TcpScanner<Socket> {
    /// Opens the raw socket, which requires root privileges.
    pub fn new(target: Ipv4Addr, ports: HashSet<u16>, timeout: f64) -> Result<Self, ScanError> {
        check_ports(&ports)?;
        check_timeout(timeout)?;

        let source = interface::source_addr()?;
        let socket = socket::raw_tcp(source)?;

        Self::with_transport(target, source, ports, timeout, socket)
    }
}

impl<T: Transport> TcpScanner<T> {
    pub fn with_transport(
        target: Ipv4Addr,
        source: Ipv4Addr,
        ports: HashSet<u16>,
        timeout: f64,
        socket: T,
    ) -> Result<Self, ScanError> {
        check_ports(&ports)?;
        let ttl = check_timeout(timeout)?;

        Ok(Self {
            target,
            source,
            socket,
            queue: ports.into_iter().collect(),
            ledger: Ledger::new(ttl),
            open: Vec::new(),
        })
    }

    /// Runs the scan to completion and returns the open ports sorted by
    /// port. Ports missing from the result are either closed or filtered.
    pub fn scan(self) -> Result<Vec<OpenPort>, ScanError> {
        log::debug!(
            "Starting SYN scan of {} port(s) on `{}` from `{}` (timeout {:?})",
            self.queue.len(),
            self.target,
            self.source,
            self.ledger.ttl()
        );

        let open = engine::run(self)?;

        log::debug!("SYN scan found {} open port(s)", open.len());

        Ok(open)
    }

    fn handle_reply(&mut self, data: &[u8], received: Instant) {
        let hdr = match pckt::ipv4_payload(data).and_then(pckt::parse_tcp_segment) {
            Ok(hdr) => hdr,
            Err(e) => {
                log::debug!("Discarding segment from `{}`: {}", self.target, e);
                return;
            }
        };

        if !SRC_PORTS.contains(&hdr.destination) {
            return;
        }

        let port = hdr.source;
        let Some(sent) = self.ledger.get_at(port, received) else {
            return;
        };

        if hdr.syn && hdr.ack {
            let rtt = received.saturating_duration_since(sent);
            if rtt < self.ledger.ttl() {
                log::debug!("Port {} is open ({:?})", port, rtt);
                self.open.push(OpenPort::new(port, rtt));
            }
            self.ledger.remove_at(port, received);
        } else if hdr.rst && hdr.ack {
            log::debug!("Port {} is closed", port);
            self.ledger.remove_at(port, received);
        }
    }
}

impl<T: Transport> Driver for TcpScanner<T> {
    type Output = Vec<OpenPort>;

    fn sources(&self) -> Vec<Source> {
        vec![Source::new(self.socket.as_raw_fd(), Interest::ReadWrite)]
    }

    fn on_readable(&mut self, _: usize) {
        let mut buf = [0; RECV_BUF_SZ];
        let (n, from) = match self.socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::debug!("{}", ScanError::PacketRecvFailed(self.target.into(), e));
                return;
            }
        };
        let received = Instant::now();

        if *from.ip() == self.target {
            self.handle_reply(&buf[..n], received);
        }
    }

    fn on_writable(&mut self, _: usize) {
        let Some(port) = self.queue.pop() else {
            return;
        };

        let src_port = rand::thread_rng().gen_range(SRC_PORTS);
        let segment =
            pckt::build_tcp_segment(self.source, src_port, self.target, port, TcpFlags::SYN);

        match self
            .socket
            .send_to(&segment, SocketAddrV4::new(self.target, port))
        {
            Ok(_) => {
                self.ledger.put(port, Instant::now());
                log::debug!("Sent SYN to port {} from port {}", port, src_port);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Never left the host, so it is still unsent.
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

    fn finish(mut self) -> Vec<OpenPort> {
        self.ledger.destroy();
        self.open.sort_unstable();
        self.open
    }
}
