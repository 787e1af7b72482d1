use std::net::Ipv4Addr;

use pnet::packet::{
    icmp::IcmpPacket,
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    tcp::MutableTcpPacket,
    udp::UdpPacket,
};

use crate::error::ScanError;

const TCP_HDR_SZ: usize = 20;
const TCP_HDR_WORDS: u8 = (TCP_HDR_SZ / 4) as u8;
const TCP_WINDOW: u16 = 8192;
const TCP_CHECKSUM_OFFSET: usize = 16;

/// Ports, sequence, acknowledgement and the offset/flags word.
pub const TCP_PREFIX_SZ: usize = 14;

const IPV4_MIN_HDR_SZ: usize = 20;
const ICMP_HDR_SZ: usize = 8;
const UDP_HDR_SZ: usize = 8;

/// Decoded fixed prefix of a TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source: u16,
    pub destination: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

#[inline]
fn ensure_len(data: &[u8], needed: usize) -> Result<(), ScanError> {
    if data.len() < needed {
        return Err(ScanError::MalformedPacket {
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

/// Internet checksum: ones' complement of the ones' complement sum of
/// big-endian 16-bit words. Odd buffers are padded with a zero byte.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = data.chunks(2).fold(0u32, |acc, word| {
        let hi = word[0] as u32;
        let lo = word.get(1).copied().unwrap_or(0) as u32;
        acc + ((hi << 8) | lo)
    });

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }

    !(sum as u16)
}

pub fn pseudo_header(src: Ipv4Addr, dest: Ipv4Addr, segment_len: u16) -> [u8; 12] {
    let mut hdr = [0; 12];
    hdr[0..4].copy_from_slice(&src.octets());
    hdr[4..8].copy_from_slice(&dest.octets());
    hdr[9] = IpNextHeaderProtocols::Tcp.0;
    hdr[10..12].copy_from_slice(&segment_len.to_be_bytes());
    hdr
}

fn tcp_checksum(src: Ipv4Addr, dest: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&pseudo_header(src, dest, segment.len() as u16));
    buf.extend_from_slice(segment);
    checksum(&buf)
}

/// True when the checksum stored in `segment` is valid for the given
/// endpoints.
pub fn verify_tcp_checksum(src: Ipv4Addr, dest: Ipv4Addr, segment: &[u8]) -> bool {
    tcp_checksum(src, dest, segment) == 0
}

pub fn build_tcp_segment(
    src: Ipv4Addr,
    src_port: u16,
    dest: Ipv4Addr,
    dest_port: u16,
    flags: u8,
) -> Vec<u8> {
    let mut raw = vec![0; TCP_HDR_SZ];
    {
        // Buffer has exactly the minimum size, so this never fails.
        let mut tcp_pckt = MutableTcpPacket::new(&mut raw).unwrap();
        tcp_pckt.set_source(src_port);
        tcp_pckt.set_destination(dest_port);
        tcp_pckt.set_sequence(0);
        tcp_pckt.set_acknowledgement(0);
        tcp_pckt.set_data_offset(TCP_HDR_WORDS);
        tcp_pckt.set_reserved(0);
        tcp_pckt.set_flags(flags);
        tcp_pckt.set_window(TCP_WINDOW);
        tcp_pckt.set_checksum(0);
        tcp_pckt.set_urgent_ptr(0);
    }

    let sum = tcp_checksum(src, dest, &raw);
    raw[TCP_CHECKSUM_OFFSET..TCP_CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());

    raw
}

pub fn parse_tcp_segment(data: &[u8]) -> Result<TcpHeader, ScanError> {
    ensure_len(data, TCP_PREFIX_SZ)?;

    let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    let dword = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

    let flags = data[13];
    let bit = |n: u8| (flags >> n) & 1 == 1;

    Ok(TcpHeader {
        source: word(0),
        destination: word(2),
        sequence: dword(4),
        acknowledgement: dword(8),
        urg: bit(5),
        ack: bit(4),
        psh: bit(3),
        rst: bit(2),
        syn: bit(1),
        fin: bit(0),
    })
}

fn ipv4_header_len(data: &[u8]) -> Result<usize, ScanError> {
    let ipv4_pckt = Ipv4Packet::new(data).ok_or(ScanError::MalformedPacket {
        needed: IPV4_MIN_HDR_SZ,
        got: data.len(),
    })?;
    let len = ipv4_pckt.get_header_length() as usize * 4;
    ensure_len(data, len.max(IPV4_MIN_HDR_SZ))?;
    Ok(len.max(IPV4_MIN_HDR_SZ))
}

/// Skips the IPv4 header that raw sockets hand back with every datagram.
pub fn ipv4_payload(data: &[u8]) -> Result<&[u8], ScanError> {
    let len = ipv4_header_len(data)?;
    Ok(&data[len..])
}

pub fn icmp_type(data: &[u8]) -> Result<u8, ScanError> {
    let icmp = ipv4_payload(data)?;
    let icmp_pckt = IcmpPacket::new(icmp).ok_or(ScanError::MalformedPacket {
        needed: data.len() - icmp.len() + 4,
        got: data.len(),
    })?;
    Ok(icmp_pckt.get_icmp_type().0)
}

/// Destination port of the UDP datagram quoted by an ICMP error message.
pub fn icmp_embedded_destination_port(data: &[u8]) -> Result<u16, ScanError> {
    let outer_len = data.len();
    let icmp = ipv4_payload(data)?;
    ensure_len(icmp, ICMP_HDR_SZ).map_err(|_| ScanError::MalformedPacket {
        needed: outer_len - icmp.len() + ICMP_HDR_SZ,
        got: outer_len,
    })?;

    let quoted = &icmp[ICMP_HDR_SZ..];
    let quoted_hdr_len = ipv4_header_len(quoted).map_err(|_| ScanError::MalformedPacket {
        needed: outer_len - quoted.len() + IPV4_MIN_HDR_SZ,
        got: outer_len,
    })?;

    let udp = &quoted[quoted_hdr_len..];
    let udp_pckt = UdpPacket::new(udp).ok_or(ScanError::MalformedPacket {
        needed: outer_len - udp.len() + UDP_HDR_SZ,
        got: outer_len,
    })?;

    Ok(udp_pckt.get_destination())
}
