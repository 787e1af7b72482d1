use std::{
    fmt::{self, Display},
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket},
    time::Duration,
};

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::{error::ScanError, interrupt};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const ECHO_READ_TIMEOUT: Duration = Duration::from_secs(2);
const HTTPS_PORT: u16 = 443;

const HTTP_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
    User-Agent: Mozilla/5.0 (X11; Linux x86_64)\r\n\r\n\r\n";
const DNS_QUERY: &[u8] = &[0; 12];
const DNS_RESPONSE: &[u8] = &[0x00, 0x00, 0x80, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
const ECHO: &[u8] = b"echo";

/// Application protocol recognised on an open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Dns,
    Echo,
    Http,
}

impl Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Service::Dns => "DNS",
                Service::Echo => "ECHO",
                Service::Http => "HTTP",
            }
        )
    }
}

/// Sends `request` over a fresh connection and returns whatever comes back.
/// Resets, refusals and timeouts all count as no answer.
fn tcp_exchange(addr: SocketAddrV4, request: &[u8], timeout: Duration) -> Option<Vec<u8>> {
    let mut stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), CONNECT_TIMEOUT).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.write_all(request).ok()?;

    let mut buf = [0; 1024];
    match stream.read(&mut buf) {
        Ok(n) if n > 0 => Some(buf[..n].to_vec()),
        _ => None,
    }
}

fn udp_exchange(addr: SocketAddrV4, request: &[u8]) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.set_read_timeout(Some(READ_TIMEOUT)).ok()?;
    socket.send_to(request, addr).ok()?;

    let mut buf = [0; 2048];
    let (n, _) = socket.recv_from(&mut buf).ok()?;
    Some(buf[..n].to_vec())
}

fn looks_like_http(reply: &[u8]) -> bool {
    let text = String::from_utf8_lossy(reply);
    text.contains("HTTP") && !text.contains("HTTPS")
}

pub fn tcp(ip: Ipv4Addr, port: u16) -> Option<Service> {
    let addr = SocketAddrV4::new(ip, port);

    if tcp_exchange(addr, ECHO, ECHO_READ_TIMEOUT).is_some_and(|r| r == ECHO) {
        return Some(Service::Echo);
    }
    if interrupt::requested() {
        return None;
    }
    if port != HTTPS_PORT
        && tcp_exchange(addr, HTTP_REQUEST, READ_TIMEOUT).is_some_and(|r| looks_like_http(&r))
    {
        return Some(Service::Http);
    }
    if interrupt::requested() {
        return None;
    }
    if tcp_exchange(addr, DNS_QUERY, READ_TIMEOUT).is_some_and(|r| r == DNS_RESPONSE) {
        return Some(Service::Dns);
    }

    None
}

pub fn udp(ip: Ipv4Addr, port: u16) -> Option<Service> {
    let addr = SocketAddrV4::new(ip, port);

    if udp_exchange(addr, DNS_QUERY).is_some_and(|r| r == DNS_RESPONSE) {
        return Some(Service::Dns);
    }
    if interrupt::requested() {
        return None;
    }
    if udp_exchange(addr, ECHO).is_some_and(|r| r == ECHO) {
        return Some(Service::Echo);
    }

    None
}

/// Guesses every port in parallel. The result follows the order of `ports`.
///
/// Once `interrupted` turns true the remaining ports are skipped and the
/// whole batch fails with [`ScanError::Interrupted`].
pub fn identify_all<P, F>(
    ip: Ipv4Addr,
    ports: &[u16],
    probe: P,
    interrupted: F,
) -> Result<Vec<Option<Service>>, ScanError>
where
    P: Fn(Ipv4Addr, u16) -> Option<Service> + Sync,
    F: Fn() -> bool + Sync,
{
    let services = ports
        .par_iter()
        .map(|&port| if interrupted() { None } else { probe(ip, port) })
        .collect::<Vec<_>>();

    if interrupted() {
        return Err(ScanError::Interrupted);
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    fn local_port(listener: &TcpListener) -> u16 {
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn recognises_tcp_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = local_port(&listener);
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0; 64];
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n]);
                }
            }
        });

        assert_eq!(tcp(Ipv4Addr::LOCALHOST, port), Some(Service::Echo));
    }

    #[test]
    fn recognises_http() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = local_port(&listener);
        thread::spawn(move || {
            for stream in listener.incoming().take(2) {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0; 512];
                if let Ok(n) = stream.read(&mut buf) {
                    if buf[..n].starts_with(b"GET") {
                        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n");
                    }
                }
            }
        });

        assert_eq!(tcp(Ipv4Addr::LOCALHOST, port), Some(Service::Http));
    }

    #[test]
    fn recognises_udp_dns() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut buf = [0; 64];
            if let Ok((_, from)) = server.recv_from(&mut buf) {
                let _ = server.send_to(DNS_RESPONSE, from);
            }
        });

        assert_eq!(udp(Ipv4Addr::LOCALHOST, port), Some(Service::Dns));
    }

    #[test]
    fn refused_port_is_unknown() {
        // Bind then drop to get a port nobody listens on.
        let port = local_port(&TcpListener::bind("127.0.0.1:0").unwrap());
        assert_eq!(tcp(Ipv4Addr::LOCALHOST, port), None);
    }

    #[test]
    fn batch_keeps_port_order() {
        let ports = (1..=64).collect::<Vec<u16>>();
        let services = identify_all(
            Ipv4Addr::LOCALHOST,
            &ports,
            |_, port| (port % 2 == 0).then_some(Service::Echo),
            || false,
        )
        .unwrap();

        assert_eq!(services.len(), ports.len());
        for (port, service) in ports.iter().zip(services) {
            assert_eq!(service.is_some(), port % 2 == 0);
        }
    }

    #[test]
    fn interrupt_skips_remaining_ports() {
        let probed = AtomicUsize::new(0);
        let ports = (1..=1000).collect::<Vec<u16>>();

        let res = identify_all(
            Ipv4Addr::LOCALHOST,
            &ports,
            |_, _| {
                probed.fetch_add(1, Ordering::SeqCst);
                None
            },
            || probed.load(Ordering::SeqCst) >= 2,
        );

        assert!(matches!(res, Err(ScanError::Interrupted)));
        assert!(probed.load(Ordering::SeqCst) < ports.len());
    }

    #[test]
    fn https_banner_is_not_http() {
        assert!(looks_like_http(b"HTTP/1.1 400 Bad Request"));
        assert!(!looks_like_http(b"HTTP/1.1 400 The plain HTTP request was sent to HTTPS port"));
        assert!(!looks_like_http(b"SSH-2.0-OpenSSH_9.6"));
    }
}
