use std::{
    io,
    mem::MaybeUninit,
    net::{Ipv4Addr, SocketAddrV4},
    time::{Duration, Instant},
};

use pnet::{
    packet::{
        icmp::{
            echo_reply::EchoReplyPacket,
            echo_request::{EchoRequestPacket, MutableEchoRequestPacket},
            IcmpTypes,
        },
        Packet,
    },
    util,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{error::ScanError, interrupt, scan::pckt};

const RECV_BUF_SZ: usize = 1500;

/// Bytes read and the IPv4 sender, if any.
type Received = io::Result<(usize, Option<Ipv4Addr>)>;

fn echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut raw = vec![0; EchoRequestPacket::minimum_packet_size()];
    {
        // Buffer has exactly the minimum size, so this never fails.
        let mut echo_pckt = MutableEchoRequestPacket::new(&mut raw).unwrap();
        echo_pckt.set_icmp_type(IcmpTypes::EchoRequest);
        echo_pckt.set_identifier(ident);
        echo_pckt.set_sequence_number(seq);
        let sum = util::checksum(echo_pckt.packet(), 1);
        echo_pckt.set_checksum(sum);
    }
    raw
}

/// True when `data` (an IPv4 datagram) is the echo reply to our request.
fn is_echo_reply(data: &[u8], ident: u16) -> bool {
    let Ok(icmp) = pckt::ipv4_payload(data) else {
        return false;
    };
    match EchoReplyPacket::new(icmp) {
        Some(reply) => {
            reply.get_icmp_type() == IcmpTypes::EchoReply && reply.get_identifier() == ident
        }
        None => false,
    }
}

/// Waits for the reply to echo `ident` until `timeout` runs out. `recv`
/// reads one datagram with the given deadline and reports its sender.
fn await_reply<R, F>(
    target: Ipv4Addr,
    ident: u16,
    timeout: Duration,
    mut recv: R,
    interrupted: F,
) -> Result<(), ScanError>
where
    R: FnMut(&mut [u8], Duration) -> Received,
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut buf = [0; RECV_BUF_SZ];

    loop {
        if interrupted() {
            return Err(ScanError::Interrupted);
        }

        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            log::debug!("No echo reply from `{}` within {:?}", target, timeout);
            return Err(ScanError::HostUnreachable(target));
        }

        match recv(&mut buf, left) {
            Ok((n, from)) => {
                if from == Some(target) && is_echo_reply(&buf[..n], ident) {
                    log::debug!("Host `{}` is up", target);
                    return Ok(());
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(ScanError::PacketRecvFailed(target.into(), e)),
        }
    }
}

/// Pings `target` once and waits up to `timeout` for the echo reply.
/// Returns [`ScanError::Interrupted`] as soon as SIGINT arrives.
pub fn check(target: Ipv4Addr, timeout: Duration) -> Result<(), ScanError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(ScanError::from_socket)?;

    let ident = rand::random::<u16>();
    socket
        .send_to(
            &echo_request(ident, 1),
            &SockAddr::from(SocketAddrV4::new(target, 0)),
        )
        .map_err(|e| ScanError::PacketSendFailed(target.into(), e))?;

    log::debug!("Sent echo request to `{}` (id {})", target, ident);

    let recv = |buf: &mut [u8], left: Duration| -> Received {
        socket.set_read_timeout(Some(left))?;
        // SAFETY: u8 and MaybeUninit<u8> share a layout, and recv_from only
        // writes initialized bytes.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, from) = socket.recv_from(uninit)?;
        Ok((n, from.as_socket_ipv4().map(|a| *a.ip())))
    };

    await_reply(target, ident, timeout, recv, interrupt::requested)
}

#[cfg(test)]
mod tests {
    use pnet::packet::{icmp::echo_reply::MutableEchoReplyPacket, ip::IpNextHeaderProtocols};

    use std::cell::Cell;

    use super::*;
    use crate::scan::pckt::tests::ipv4_wrap;

    const TARGET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

    fn reply(ident: u16) -> Vec<u8> {
        let mut raw = vec![0; EchoReplyPacket::minimum_packet_size()];
        {
            let mut echo_pckt = MutableEchoReplyPacket::new(&mut raw).unwrap();
            echo_pckt.set_icmp_type(IcmpTypes::EchoReply);
            echo_pckt.set_identifier(ident);
            echo_pckt.set_sequence_number(1);
        }
        ipv4_wrap(
            TARGET,
            Ipv4Addr::new(192, 168, 1, 10),
            IpNextHeaderProtocols::Icmp,
            &raw,
        )
    }

    #[test]
    fn echo_request_is_checksummed() {
        let raw = echo_request(0xbeef, 1);
        assert_eq!(raw[0], IcmpTypes::EchoRequest.0);
        assert_eq!(pckt::checksum(&raw), 0);
        assert_eq!(&raw[4..8], &[0xbe, 0xef, 0x00, 0x01]);
    }

    #[test]
    fn matches_only_own_reply() {
        assert!(is_echo_reply(&reply(7), 7));
        assert!(!is_echo_reply(&reply(8), 7));
        assert!(!is_echo_reply(&reply(7)[..22], 7));
    }

    #[test]
    fn reply_ends_the_wait() {
        let mut replies = vec![reply(9), reply(7)];
        let recv = |buf: &mut [u8], _: Duration| -> Received {
            let packet = replies.pop().unwrap();
            buf[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), Some(TARGET)))
        };

        assert!(await_reply(TARGET, 9, Duration::from_secs(5), recv, || false).is_ok());
    }

    #[test]
    fn silence_means_unreachable() {
        let recv = |_: &mut [u8], left: Duration| -> Received {
            std::thread::sleep(left);
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        };

        assert!(matches!(
            await_reply(TARGET, 1, Duration::from_millis(200), recv, || false),
            Err(ScanError::HostUnreachable(ip)) if ip == TARGET
        ));
    }

    #[test]
    fn interrupt_stops_waiting() {
        let interrupted = Cell::new(false);
        let recv = |_: &mut [u8], _: Duration| -> Received {
            // SIGINT lands while blocked in recv.
            interrupted.set(true);
            Err(io::Error::from(io::ErrorKind::Interrupted))
        };

        let start = Instant::now();
        let res = await_reply(TARGET, 1, Duration::from_secs(30), recv, || interrupted.get());

        assert!(matches!(res, Err(ScanError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    #[ignore] // Requires CAP_NET_RAW: sudo cargo test -- --ignored
    fn loopback_is_alive() {
        assert!(check(Ipv4Addr::LOCALHOST, Duration::from_secs(1)).is_ok());
    }
}
