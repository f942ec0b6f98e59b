//! Manual IPv4/IPv6 + TCP/UDP packet serialization.
//!
//! Raw-socket probes carry their own network and transport headers, so all
//! fields are written by hand: version/lengths/TTL, one's-complement
//! checksums over the family-appropriate pseudo-header, and the
//! receiver-recoverable fingerprint values derived from the source port and
//! destination address.

use std::net::IpAddr;

use crc::{Crc, CRC_32_ISO_HDLC, CRC_64_XZ};

/// CRC-32 with the IEEE polynomial (zlib/`crc32.ChecksumIEEE` compatible).
pub const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-64 with the ECMA-182 polynomial in reflected form (Go `crc64` ECMA
/// table / CRC-64/XZ compatible).
pub const CRC64_ECMA: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

// TCP flag bits (header byte 13).
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

// ─────────────────────────────────────────────────────────────────────────────
// Fingerprints
// ─────────────────────────────────────────────────────────────────────────────

/// Express any address as 16 bytes (IPv4 becomes the IPv4-mapped form).
pub fn ip_to16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// The 20-byte fingerprint input: `sport` as a little-endian u32 followed by
/// the destination address in 16-byte form.
pub fn fingerprint_input(sport: u16, dst: IpAddr) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[..4].copy_from_slice(&(sport as u32).to_le_bytes());
    buf[4..].copy_from_slice(&ip_to16(dst));
    buf
}

/// ACK-number fingerprint: CRC32-IEEE over [`fingerprint_input`].
///
/// Injected resets usually echo the flow 5-tuple and the data segment's
/// sequence number, so a response can be validated against the probe's
/// source port and destination without any per-flow state.
pub fn fingerprint_ack(sport: u16, dst: IpAddr) -> u32 {
    CRC32_IEEE.checksum(&fingerprint_input(sport, dst))
}

/// Connection-ID fingerprint: CRC64-ECMA over [`fingerprint_input`],
/// little-endian encoded. QUIC servers echo the client's destination
/// connection ID, making this recoverable from responses.
pub fn fingerprint_cid(sport: u16, dst: IpAddr) -> [u8; 8] {
    CRC64_ECMA
        .checksum(&fingerprint_input(sport, dst))
        .to_le_bytes()
}

// ─────────────────────────────────────────────────────────────────────────────
// Checksums
// ─────────────────────────────────────────────────────────────────────────────

/// Incremental one's-complement sum over 16-bit big-endian words.
struct Checksum {
    sum: u32,
    pending: Option<u8>,
}

impl Checksum {
    fn new() -> Self {
        Self { sum: 0, pending: None }
    }

    fn add(&mut self, data: &[u8]) {
        let mut data = data;
        if let Some(hi) = self.pending.take() {
            if let Some((&lo, rest)) = data.split_first() {
                self.sum += u16::from_be_bytes([hi, lo]) as u32;
                data = rest;
            } else {
                self.pending = Some(hi);
                return;
            }
        }
        let mut chunks = data.chunks_exact(2);
        for w in &mut chunks {
            self.sum += u16::from_be_bytes([w[0], w[1]]) as u32;
        }
        if let [odd] = chunks.remainder() {
            self.pending = Some(*odd);
        }
    }

    fn finish(mut self) -> u16 {
        if let Some(hi) = self.pending {
            self.sum += (hi as u32) << 8;
        }
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
        !(self.sum as u16)
    }
}

/// IPv4 header checksum. The checksum field (bytes 10-11) must be zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut ck = Checksum::new();
    ck.add(header);
    ck.finish()
}

/// L4 checksum over the family-appropriate pseudo-header plus the segment.
/// The segment's own checksum field must be zero.
pub fn l4_checksum(src: IpAddr, dst: IpAddr, proto: u8, segment: &[u8]) -> u16 {
    let mut ck = Checksum::new();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            // src(4) dst(4) zero(1) proto(1) len(2)
            ck.add(&s.octets());
            ck.add(&d.octets());
            ck.add(&[0, proto]);
            ck.add(&(segment.len() as u16).to_be_bytes());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            // src(16) dst(16) len(4) zero(3) next-header(1)
            ck.add(&s.octets());
            ck.add(&d.octets());
            ck.add(&(segment.len() as u32).to_be_bytes());
            ck.add(&[0, 0, 0, proto]);
        }
        _ => debug_assert!(false, "pseudo-header families must match"),
    }
    ck.add(segment);
    ck.finish()
}

// ─────────────────────────────────────────────────────────────────────────────
// IP framing
// ─────────────────────────────────────────────────────────────────────────────

/// Network-layer fields shared by the TCP and UDP builders.
#[derive(Debug, Clone, Copy)]
pub struct IpPair {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 identification. Zero lets the kernel fill it on HDRINCL sockets.
    pub id: u16,
    /// IPv6 flow label (low 20 bits).
    pub flow_label: u32,
}

impl IpPair {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst, id: 0, flow_label: 0 }
    }
}

/// Write the IP header for `l4_len` payload bytes and return the full
/// packet buffer with the header populated and the payload space zeroed.
fn ip_header(ip: &IpPair, proto: u8, l4_len: usize) -> Vec<u8> {
    match (ip.src, ip.dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total = 20 + l4_len;
            let mut pkt = vec![0u8; total];
            pkt[0] = 0x45; // version 4, IHL 5
            pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            pkt[4..6].copy_from_slice(&ip.id.to_be_bytes());
            pkt[8] = 64; // TTL
            pkt[9] = proto;
            pkt[12..16].copy_from_slice(&src.octets());
            pkt[16..20].copy_from_slice(&dst.octets());
            let ck = ipv4_header_checksum(&pkt[..20]);
            pkt[10..12].copy_from_slice(&ck.to_be_bytes());
            pkt
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut pkt = vec![0u8; 40 + l4_len];
            let vtcfl = (6u32 << 28) | (ip.flow_label & 0x000f_ffff);
            pkt[0..4].copy_from_slice(&vtcfl.to_be_bytes());
            pkt[4..6].copy_from_slice(&(l4_len as u16).to_be_bytes());
            pkt[6] = proto; // next header
            pkt[7] = 64; // hop limit
            pkt[8..24].copy_from_slice(&src.octets());
            pkt[24..40].copy_from_slice(&dst.octets());
            pkt
        }
        _ => unreachable!("callers pick the source by destination family"),
    }
}

fn ip_header_len(ip: &IpPair) -> usize {
    if ip.src.is_ipv4() {
        20
    } else {
        40
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TCP framing
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-layer fields for one TCP segment.
#[derive(Debug, Clone)]
pub struct TcpFields<'a> {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

/// Serialize a complete IP+TCP packet.
///
/// Options are zero-padded to a 4-byte boundary and reflected in the data
/// offset. When `checksums` is false the TCP checksum field is left zero
/// (the IPv4 header checksum is always valid).
pub fn build_tcp_packet(ip: &IpPair, f: &TcpFields<'_>, checksums: bool) -> Vec<u8> {
    let opts_padded = (f.options.len() + 3) & !3;
    let tcp_len = 20 + opts_padded + f.payload.len();
    let ihl = ip_header_len(ip);
    let mut pkt = ip_header(ip, IPPROTO_TCP, tcp_len);

    let t = &mut pkt[ihl..];
    t[0..2].copy_from_slice(&f.sport.to_be_bytes());
    t[2..4].copy_from_slice(&f.dport.to_be_bytes());
    t[4..8].copy_from_slice(&f.seq.to_be_bytes());
    t[8..12].copy_from_slice(&f.ack.to_be_bytes());
    t[12] = (((20 + opts_padded) / 4) as u8) << 4;
    t[13] = f.flags;
    t[14..16].copy_from_slice(&f.window.to_be_bytes());
    // bytes 16-17: checksum, 18-19: urgent pointer
    t[20..20 + f.options.len()].copy_from_slice(f.options);
    t[20 + opts_padded..].copy_from_slice(f.payload);

    if checksums {
        let ck = l4_checksum(ip.src, ip.dst, IPPROTO_TCP, &pkt[ihl..]);
        pkt[ihl + 16..ihl + 18].copy_from_slice(&ck.to_be_bytes());
    }
    pkt
}

/// TCP options sent on SYN: MSS 1440, SACK-permitted, NOP, window scale 7.
pub const SYN_OPTIONS: &[u8] = &[
    2, 4, 0x05, 0xa0, // MSS 1440
    4, 2, // SACK permitted
    1, // NOP
    3, 3, 7, // window scale 7
];

/// TCP options sent on the bare ACK: two NOPs.
pub const ACK_OPTIONS: &[u8] = &[1, 1];

// ─────────────────────────────────────────────────────────────────────────────
// UDP framing
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize a complete IP+UDP packet.
pub fn build_udp_packet(
    ip: &IpPair,
    sport: u16,
    dport: u16,
    payload: &[u8],
    checksums: bool,
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ihl = ip_header_len(ip);
    let mut pkt = ip_header(ip, IPPROTO_UDP, udp_len);

    let u = &mut pkt[ihl..];
    u[0..2].copy_from_slice(&sport.to_be_bytes());
    u[2..4].copy_from_slice(&dport.to_be_bytes());
    u[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    u[8..].copy_from_slice(payload);

    if checksums {
        let ck = l4_checksum(ip.src, ip.dst, IPPROTO_UDP, &pkt[ihl..]);
        // An all-zero UDP checksum means "not computed"; RFC 768 maps it
        // to 0xffff.
        let ck = if ck == 0 { 0xffff } else { ck };
        pkt[ihl + 6..ihl + 8].copy_from_slice(&ck.to_be_bytes());
    }
    pkt
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
