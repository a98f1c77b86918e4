//! Packet decoder: raw Ethernet frame to flow-key header fields.
//!
//! A pure function of the frame bytes. Malformed or unsupported frames are
//! classified, never panicked on; the aggregator counts them and moves on.
//! When a TCP payload starts with a plaintext HTTP request line, the Host
//! header (or an absolute-form request target) is extracted opportunistically
//! as a hint; its absence is normal, not an error.

use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::flow_table::{DecodedPacket, FlowKey, Transport};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame too short for the headers it claims to carry.
    Truncated,
    /// Link-layer payload is not IPv4/IPv6.
    UnsupportedEtherType(u16),
    /// IP payload is not TCP/UDP.
    UnsupportedTransport(u8),
    /// IP version field disagrees with the EtherType.
    BadIpHeader,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated frame"),
            DecodeError::UnsupportedEtherType(t) => write!(f, "unsupported ethertype 0x{:04x}", t),
            DecodeError::UnsupportedTransport(p) => write!(f, "unsupported ip protocol {}", p),
            DecodeError::BadIpHeader => write!(f, "malformed ip header"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_u16(frame: &[u8], offset: usize) -> Result<u16, DecodeError> {
    let bytes = frame
        .get(offset..offset + 2)
        .ok_or(DecodeError::Truncated)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decodes one captured frame into a raw-orientation flow key plus hints.
pub fn decode(frame: &[u8], timestamp: DateTime<Utc>) -> Result<DecodedPacket, DecodeError> {
    if frame.len() < 14 {
        return Err(DecodeError::Truncated);
    }

    // EtherType sits at offset 12; skip over any VLAN tag chain (802.1Q and
    // 802.1ad stack 4-byte tags in front of the real EtherType).
    let mut offset = 12;
    let mut ether_type = read_u16(frame, offset)?;
    while ether_type == ETHERTYPE_VLAN || ether_type == ETHERTYPE_QINQ {
        offset += 4;
        ether_type = read_u16(frame, offset)?;
    }
    let ip_offset = offset + 2;

    let (src_addr, dst_addr, ip_proto, transport_offset) = match ether_type {
        ETHERTYPE_IPV4 => parse_ipv4(frame, ip_offset)?,
        ETHERTYPE_IPV6 => parse_ipv6(frame, ip_offset)?,
        other => return Err(DecodeError::UnsupportedEtherType(other)),
    };

    let protocol = match ip_proto {
        IPPROTO_TCP => Transport::Tcp,
        IPPROTO_UDP => Transport::Udp,
        other => return Err(DecodeError::UnsupportedTransport(other)),
    };

    let src_port = read_u16(frame, transport_offset)?;
    let dst_port = read_u16(frame, transport_offset + 2)?;

    let host_hint = match protocol {
        Transport::Tcp => tcp_payload(frame, transport_offset).and_then(extract_host_hint),
        Transport::Udp => None,
    };

    Ok(DecodedPacket {
        key: FlowKey {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
        },
        timestamp,
        frame_len: frame.len() as u64,
        host_hint,
    })
}

fn parse_ipv4(frame: &[u8], ip_offset: usize) -> Result<(IpAddr, IpAddr, u8, usize), DecodeError> {
    let header = frame
        .get(ip_offset..ip_offset + 20)
        .ok_or(DecodeError::Truncated)?;

    if header[0] >> 4 != 4 {
        return Err(DecodeError::BadIpHeader);
    }
    // IHL is in 32-bit words; minimum 5.
    let header_len = ((header[0] & 0x0F) as usize) * 4;
    if header_len < 20 {
        return Err(DecodeError::BadIpHeader);
    }
    if frame.len() < ip_offset + header_len {
        return Err(DecodeError::Truncated);
    }

    let protocol = header[9];
    let src = Ipv4Addr::new(header[12], header[13], header[14], header[15]);
    let dst = Ipv4Addr::new(header[16], header[17], header[18], header[19]);
    Ok((
        IpAddr::V4(src),
        IpAddr::V4(dst),
        protocol,
        ip_offset + header_len,
    ))
}

fn parse_ipv6(frame: &[u8], ip_offset: usize) -> Result<(IpAddr, IpAddr, u8, usize), DecodeError> {
    let header = frame
        .get(ip_offset..ip_offset + 40)
        .ok_or(DecodeError::Truncated)?;

    if header[0] >> 4 != 6 {
        return Err(DecodeError::BadIpHeader);
    }
    // Fixed 40-byte header only; frames whose next-header is an extension
    // chain fall out as UnsupportedTransport.
    let next_header = header[6];
    let src: [u8; 16] = header[8..24].try_into().map_err(|_| DecodeError::Truncated)?;
    let dst: [u8; 16] = header[24..40].try_into().map_err(|_| DecodeError::Truncated)?;
    Ok((
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        next_header,
        ip_offset + 40,
    ))
}

fn tcp_payload(frame: &[u8], tcp_offset: usize) -> Option<&[u8]> {
    // Data offset (header length in words) lives in the high nibble of
    // byte 12 of the TCP header.
    let data_offset_byte = *frame.get(tcp_offset + 12)?;
    let header_len = ((data_offset_byte >> 4) as usize) * 4;
    if header_len < 20 {
        return None;
    }
    frame.get(tcp_offset + header_len..)
}

const HTTP_METHODS: [&str; 8] = [
    "GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ",
];

/// Best-effort host extraction from a plaintext HTTP request. Returns None
/// for anything that does not look like one; never fails.
fn extract_host_hint(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    // Only look at the first KB; headers past that are not worth chasing.
    let text = std::str::from_utf8(&payload[..payload.len().min(1024)]).ok()?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    if !HTTP_METHODS.iter().any(|m| request_line.starts_with(m)) {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .strip_prefix("Host:")
            .or_else(|| line.strip_prefix("host:"))
        {
            let host = value.trim();
            if !host.is_empty() {
                return Some(host.to_string());
            }
        }
    }

    // No Host header; an absolute-form request target still names the host.
    let target = request_line.split(' ').nth(1)?;
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let host = rest.split('/').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45; // version 4, IHL 5
        header[9] = proto;
        header[12..16].copy_from_slice(&src);
        header[16..20].copy_from_slice(&dst);
        header.extend_from_slice(payload);
        header
    }

    fn tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0..2].copy_from_slice(&src_port.to_be_bytes());
        header[2..4].copy_from_slice(&dst_port.to_be_bytes());
        header[12] = 0x50; // data offset 5 words
        header.extend_from_slice(payload);
        header
    }

    fn udp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut header = vec![0u8; 8];
        header[0..2].copy_from_slice(&src_port.to_be_bytes());
        header[2..4].copy_from_slice(&dst_port.to_be_bytes());
        header
    }

    #[test]
    fn decodes_ipv4_tcp() {
        let frame = ethernet(
            0x0800,
            &ipv4(6, [10, 0, 0, 1], [93, 184, 216, 34], &tcp(50000, 80, b"")),
        );
        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.key.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pkt.key.dst_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(pkt.key.src_port, 50000);
        assert_eq!(pkt.key.dst_port, 80);
        assert_eq!(pkt.key.protocol, Transport::Tcp);
        assert_eq!(pkt.frame_len, frame.len() as u64);
        assert!(pkt.host_hint.is_none());
    }

    #[test]
    fn decodes_ipv4_udp() {
        let frame = ethernet(0x0800, &ipv4(17, [10, 0, 0, 1], [8, 8, 8, 8], &udp(5353, 53)));
        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.key.protocol, Transport::Udp);
        assert_eq!(pkt.key.dst_port, 53);
    }

    #[test]
    fn decodes_ipv6_tcp() {
        let mut header = vec![0u8; 40];
        header[0] = 0x60;
        header[6] = 6; // next header TCP
        header[23] = 1; // ::1 src
        header[39] = 2; // ::2 dst
        header.extend_from_slice(&tcp(4242, 443, b""));
        let frame = ethernet(0x86DD, &header);

        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.key.src_addr, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(pkt.key.dst_addr, "::2".parse::<IpAddr>().unwrap());
        assert_eq!(pkt.key.src_port, 4242);
        assert_eq!(pkt.key.dst_port, 443);
    }

    #[test]
    fn decodes_through_vlan_tags() {
        let inner = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(1234, 80, b""));
        // 802.1ad outer tag then 802.1Q inner tag.
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x88A8u16.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]);
        frame.extend_from_slice(&0x8100u16.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x0A]);
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&inner);

        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.key.src_port, 1234);
        assert_eq!(pkt.key.dst_port, 80);
    }

    #[test]
    fn extracts_host_header() {
        let payload = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n";
        let frame = ethernet(
            0x0800,
            &ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(50000, 80, payload)),
        );
        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.host_hint.as_deref(), Some("example.com"));
    }

    #[test]
    fn extracts_host_from_absolute_target() {
        let payload = b"GET http://example.org/path HTTP/1.0\r\n\r\n";
        let frame = ethernet(
            0x0800,
            &ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(50000, 80, payload)),
        );
        let pkt = decode(&frame, now()).unwrap();
        assert_eq!(pkt.host_hint.as_deref(), Some("example.org"));
    }

    #[test]
    fn non_http_payload_yields_no_hint() {
        let payload = [0x16, 0x03, 0x01, 0x02, 0x00]; // TLS client hello prefix
        let frame = ethernet(
            0x0800,
            &ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(50000, 443, &payload)),
        );
        let pkt = decode(&frame, now()).unwrap();
        assert!(pkt.host_hint.is_none());
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(decode(&[0u8; 10], now()), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_arp() {
        let frame = ethernet(0x0806, &[0u8; 28]);
        assert_eq!(
            decode(&frame, now()),
            Err(DecodeError::UnsupportedEtherType(0x0806))
        );
    }

    #[test]
    fn rejects_icmp() {
        let frame = ethernet(0x0800, &ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &[0u8; 8]));
        assert_eq!(
            decode(&frame, now()),
            Err(DecodeError::UnsupportedTransport(1))
        );
    }

    #[test]
    fn rejects_truncated_ip_header() {
        let frame = ethernet(0x0800, &[0x45, 0x00, 0x00]);
        assert_eq!(decode(&frame, now()), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_bad_ihl() {
        let mut payload = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(1, 2, b""));
        payload[0] = 0x42; // IHL 2 words, below the legal minimum
        let frame = ethernet(0x0800, &payload);
        assert_eq!(decode(&frame, now()), Err(DecodeError::BadIpHeader));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut payload = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(1, 2, b""));
        payload[0] = 0x65; // claims version 6 under an IPv4 ethertype
        let frame = ethernet(0x0800, &payload);
        assert_eq!(decode(&frame, now()), Err(DecodeError::BadIpHeader));
    }

    #[test]
    fn rejects_frame_cut_inside_ports() {
        let mut payload = ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], b"");
        payload.extend_from_slice(&[0x12]); // one byte of TCP header
        let frame = ethernet(0x0800, &payload);
        assert_eq!(decode(&frame, now()), Err(DecodeError::Truncated));
    }

    #[test]
    fn garbage_never_panics() {
        for len in 0..64 {
            let frame: Vec<u8> = (0..len).map(|i| (i * 37 % 251) as u8).collect();
            let _ = decode(&frame, now());
        }
    }
}
