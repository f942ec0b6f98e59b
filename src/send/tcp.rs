//! TCP framing layer.
//!
//! Wraps a probe payload in IP+TCP headers and optionally emits a SYN and a
//! bare ACK before the data segment, imitating the visible start of a
//! handshake so that middleboxes tracking partial TCP state will evaluate
//! the payload. All three packets share one 5-tuple; the data segment's ACK
//! number carries the recoverable probe fingerprint.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::packet::{
    self, IpPair, TcpFields, ACK_OPTIONS, SYN_OPTIONS, TCP_ACK, TCP_PSH, TCP_SYN,
};
use super::raw::RawSender;
use super::route::{self, RouteError};
use super::SendError;
use crate::SharedRng;

/// Well-known public addresses used once at construction to learn the
/// host's outbound source address per family.
const V4_ROUTE_PROBE: &str = "1.2.3.4";
const V6_ROUTE_PROBE: &str = "2606:4700::";

/// Per-probe options applied to each TCP send.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Send a SYN before the data to prime flow-tracking middleboxes.
    pub syn: bool,
    /// Send a bare ACK between the SYN and the data.
    pub ack: bool,
    /// Delay observed after the SYN and after the ACK.
    pub syn_delay: Duration,
    /// Compute L4 checksums.
    pub checksums: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            syn: true,
            ack: true,
            syn_delay: Duration::from_millis(2),
            checksums: true,
        }
    }
}

/// The packets and log fields produced for one probe.
struct TcpProbe {
    syn: Vec<u8>,
    ack: Vec<u8>,
    data: Vec<u8>,
    seq_ack: String,
    sport: u16,
}

/// TCP sender: source addresses plus a handle to the raw-socket pool.
pub struct TcpSender {
    raw: Arc<RawSender>,
    src4: Option<IpAddr>,
    src6: Option<IpAddr>,
    rng: SharedRng,
}

impl TcpSender {
    /// Resolve source addresses and wrap the raw sender.
    ///
    /// IPv4 resolution failure is fatal; IPv6 failure degrades with a
    /// warning (v6 probes will then fail per-send with
    /// [`SendError::NoSourceForFamily`]).
    pub fn new(
        raw: Arc<RawSender>,
        laddr4: &str,
        laddr6: &str,
        rng: SharedRng,
    ) -> Result<Self, RouteError> {
        let src4 = route::resolve_source(laddr4, V4_ROUTE_PROBE.parse().expect("literal"))?;
        let src6 = match route::resolve_source(laddr6, V6_ROUTE_PROBE.parse().expect("literal")) {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!(error = %e, "failed to init IPv6 - likely not supported");
                None
            }
        };
        Ok(Self { raw, src4: Some(src4), src6, rng })
    }

    /// Send a probe payload to `dst:dport`.
    ///
    /// A zero `sport` selects a random source port and a random ACK value;
    /// a preselected `sport` (from the key table) derives the ACK from the
    /// CRC32 fingerprint so responses can be attributed.
    ///
    /// Returns `(seq_ack_hex, sport)` for logging.
    pub async fn send(
        &self,
        dst: IpAddr,
        dport: u16,
        sport: u16,
        payload: &[u8],
        opts: &TcpOptions,
    ) -> Result<(String, u16), SendError> {
        let src = self.source_for(dst)?;
        let (seq0, sport, ack) = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            let seq0: u32 = rng.gen();
            if sport == 0 {
                (seq0, rng.gen_range(1000..=65535), rng.gen())
            } else {
                (seq0, sport, packet::fingerprint_ack(sport, dst))
            }
        };

        let probe = build_probe(src, dst, dport, sport, seq0, ack, payload, opts.checksums);

        if opts.syn {
            self.raw.send(dst, probe.syn).await?;
            tokio::time::sleep(opts.syn_delay).await;
        }
        if opts.ack {
            self.raw.send(dst, probe.ack).await?;
            tokio::time::sleep(opts.syn_delay).await;
        }
        self.raw.send(dst, probe.data).await?;

        Ok((probe.seq_ack, probe.sport))
    }

    fn source_for(&self, dst: IpAddr) -> Result<IpAddr, SendError> {
        let src = if dst.is_ipv4() { self.src4 } else { self.src6 };
        src.ok_or(SendError::NoSourceForFamily(if dst.is_ipv4() {
            "IPv4"
        } else {
            "IPv6"
        }))
    }
}

/// Build the SYN/ACK/data triplet for one probe.
///
/// SYN carries `seq0`; the ACK and the data segment carry `seq0 + 1`. The
/// fixed windows and option sets match a plausible Linux client handshake.
#[allow(clippy::too_many_arguments)]
fn build_probe(
    src: IpAddr,
    dst: IpAddr,
    dport: u16,
    sport: u16,
    seq0: u32,
    ack: u32,
    payload: &[u8],
    checksums: bool,
) -> TcpProbe {
    let ip = IpPair::new(src, dst);

    let syn = packet::build_tcp_packet(
        &ip,
        &TcpFields {
            sport,
            dport,
            seq: seq0,
            ack: 0,
            flags: TCP_SYN,
            window: 28800,
            options: SYN_OPTIONS,
            payload: &[],
        },
        checksums,
    );
    let ack_pkt = packet::build_tcp_packet(
        &ip,
        &TcpFields {
            sport,
            dport,
            seq: seq0.wrapping_add(1),
            ack,
            flags: TCP_ACK,
            window: 225,
            options: ACK_OPTIONS,
            payload: &[],
        },
        checksums,
    );
    let data = packet::build_tcp_packet(
        &ip,
        &TcpFields {
            sport,
            dport,
            seq: seq0.wrapping_add(1),
            ack,
            flags: TCP_PSH | TCP_ACK,
            window: 502,
            options: &[],
            payload,
        },
        checksums,
    );

    TcpProbe {
        syn,
        ack: ack_pkt,
        data,
        seq_ack: format!("{:x} {:x}", seq0.wrapping_add(1), ack),
        sport,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_probe() -> TcpProbe {
        build_probe(
            "192.168.1.10".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            443,
            1234,
            1000,
            packet::fingerprint_ack(1234, "10.0.0.1".parse().unwrap()),
            b"hello tls",
            true,
        )
    }

    fn tcp_hdr(pkt: &[u8]) -> &[u8] {
        &pkt[20..]
    }

    #[test]
    fn test_triplet_shares_five_tuple() {
        let p = test_probe();
        for pkt in [&p.syn, &p.ack, &p.data] {
            assert_eq!(&pkt[12..16], &[192, 168, 1, 10], "source IP");
            assert_eq!(&pkt[16..20], &[10, 0, 0, 1], "destination IP");
            let t = tcp_hdr(pkt);
            assert_eq!(u16::from_be_bytes([t[0], t[1]]), 1234, "source port");
            assert_eq!(u16::from_be_bytes([t[2], t[3]]), 443, "destination port");
        }
    }

    #[test]
    fn test_sequence_number_law() {
        let p = test_probe();
        let seq = |pkt: &[u8]| u32::from_be_bytes(tcp_hdr(pkt)[4..8].try_into().unwrap());
        assert_eq!(seq(&p.syn), 1000, "SYN carries seq0");
        assert_eq!(seq(&p.ack), 1001, "ACK carries seq0+1");
        assert_eq!(seq(&p.data), 1001, "data carries seq0+1");
    }

    #[test]
    fn test_preselected_sport_sets_fingerprint_ack() {
        let dst: IpAddr = "10.0.0.1".parse().unwrap();
        let p = test_probe();
        let expected = packet::fingerprint_ack(1234, dst);
        let ack_field = u32::from_be_bytes(tcp_hdr(&p.data)[8..12].try_into().unwrap());
        assert_eq!(ack_field, expected, "data ACK must be the CRC32 fingerprint");
        let ack_field = u32::from_be_bytes(tcp_hdr(&p.ack)[8..12].try_into().unwrap());
        assert_eq!(ack_field, expected, "bare ACK carries the same fingerprint");
    }

    #[test]
    fn test_flags_and_windows() {
        let p = test_probe();
        let flags = |pkt: &[u8]| tcp_hdr(pkt)[13];
        let window = |pkt: &[u8]| u16::from_be_bytes(tcp_hdr(pkt)[14..16].try_into().unwrap());

        assert_eq!(flags(&p.syn), TCP_SYN);
        assert_eq!(window(&p.syn), 28800);
        assert_eq!(flags(&p.ack), TCP_ACK);
        assert_eq!(window(&p.ack), 225);
        assert_eq!(flags(&p.data), TCP_PSH | TCP_ACK);
        assert_eq!(window(&p.data), 502);
    }

    #[test]
    fn test_data_segment_carries_payload() {
        let p = test_probe();
        // 20 IP + 20 TCP (no options on data).
        assert_eq!(&p.data[40..], b"hello tls");
    }

    #[test]
    fn test_syn_ack_carry_no_payload() {
        let p = test_probe();
        assert_eq!(p.syn.len(), 52, "SYN: 20 IP + 32 TCP");
        assert_eq!(p.ack.len(), 44, "ACK: 20 IP + 24 TCP");
    }

    #[test]
    fn test_seq_ack_string_format() {
        let p = test_probe();
        let ack = packet::fingerprint_ack(1234, "10.0.0.1".parse().unwrap());
        assert_eq!(p.seq_ack, format!("{:x} {:x}", 1001, ack));
        assert_eq!(p.sport, 1234);
    }
}
