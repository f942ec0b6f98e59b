//! Per-protocol probe fabricators and the dispatch surface.
//!
//! Each probe type builds bit-exact payload bytes, hands them to the TCP or
//! UDP framer, and optionally interprets captured response frames. Dispatch
//! is a tagged enum rather than trait objects: the variant set is closed
//! and the orchestrator needs a single `send_probe` entry point.

pub mod dns;
pub mod dtls;
pub mod http;
pub mod quic;
pub mod tls;
pub mod utls;

use std::net::IpAddr;
use std::sync::Arc;

use crate::send::SendError;
use crate::track::KeyTable;

/// Error from probe construction or transmission.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to build {0} payload: {1}")]
    BuildPayload(&'static str, String),

    #[error("domain {0:?} missing from key table")]
    UnknownDomain(String),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("mal-formatted port range - must be \"MIN-MAX\" (e.g. \"1000-65535\"): {0:?}")]
    PortRangeSyntax(String),
}

/// Callback invoked with each captured link-layer frame.
pub type PacketCallback = Box<dyn Fn(&[u8]) + Send>;

/// A configured probe instance of one protocol.
pub enum Prober {
    Dns(dns::DnsProber),
    Http(http::HttpProber),
    Tls(tls::TlsProber),
    Utls(utls::UtlsProber),
    Quic(quic::QuicProber),
    Dtls(dtls::DtlsProber),
}

impl Prober {
    /// Short name, also the capture file stem (`<name>.pcap.gz`).
    pub fn name(&self) -> &'static str {
        match self {
            Prober::Dns(_) => "dns",
            Prober::Http(_) => "http",
            Prober::Tls(_) => "tls",
            Prober::Utls(_) => "utls",
            Prober::Quic(_) => "quic",
            Prober::Dtls(_) => "dtls",
        }
    }

    /// BPF filter selecting this probe's possible responses.
    pub fn bpf_filter(&self) -> &'static str {
        match self {
            Prober::Dns(_) => "icmp or icmp6 or udp src port 53",
            Prober::Http(_) => "tcp src port 80",
            Prober::Tls(_) | Prober::Utls(_) => "icmp or tcp src port 443",
            Prober::Quic(_) => "icmp or icmp6 or udp src port 443",
            Prober::Dtls(_) => "icmp or udp src port 443",
        }
    }

    /// Build and transmit one probe for `(ip, domain)`.
    pub async fn send_probe(
        &self,
        ip: IpAddr,
        domain: &str,
        verbose: bool,
    ) -> Result<(), ProbeError> {
        match self {
            Prober::Dns(p) => p.send_probe(ip, domain, verbose).await,
            Prober::Http(p) => p.send_probe(ip, domain, verbose).await,
            Prober::Tls(p) => p.send_probe(ip, domain, verbose).await,
            Prober::Utls(p) => p.send_probe(ip, domain, verbose).await,
            Prober::Quic(p) => p.send_probe(ip, domain, verbose).await,
            Prober::Dtls(p) => p.send_probe(ip, domain, verbose).await,
        }
    }

    /// Live-result callback for the capture pipeline, when the protocol has
    /// one. QUIC and DTLS responses are only archived to pcap.
    pub fn packet_callback(self: &Arc<Self>) -> Option<PacketCallback> {
        match **self {
            Prober::Quic(_) | Prober::Dtls(_) => None,
            _ => {
                let p = Arc::clone(self);
                Some(Box::new(move |frame| match &*p {
                    Prober::Dns(d) => d.handle_packet(frame),
                    Prober::Http(h) => h.handle_packet(frame),
                    Prober::Tls(t) => t.handle_packet(frame),
                    Prober::Utls(u) => u.handle_packet(frame),
                    Prober::Quic(_) | Prober::Dtls(_) => {}
                }))
            }
        }
    }
}

/// Log one attributed result line for a TCP-based probe response.
///
/// Injected RSTs are addressed at the probe's source port, which is the
/// domain's key-table value; the reverse lookup recovers the domain.
pub(crate) fn log_tcp_result(label: &str, dkt: &KeyTable<u16>, frame: &[u8]) {
    let Some(parsed) = parse_frame(frame) else { return };
    let Transport::Tcp { dport, flags, .. } = parsed.transport else {
        return;
    };
    let rst = flags & crate::send::packet::TCP_RST != 0;
    match dkt.get_key(dport) {
        Some(domain) => {
            tracing::info!("RESULT {label} {} {domain} rst={rst}", parsed.src);
        }
        None => tracing::info!("RESULT {label} {} rst={rst}", parsed.src),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire helpers shared by the hello builders
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn be16(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

pub(crate) fn be24(v: u32) -> [u8; 3] {
    let b = v.to_be_bytes();
    [b[1], b[2], b[3]]
}

/// Decode a static hex constant.
pub(crate) fn unhex(s: &str) -> Vec<u8> {
    hex::decode(s).expect("static hex constant")
}

/// server_name extension data: one host_name entry.
pub(crate) fn sni_ext_data(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 5);
    out.extend_from_slice(&be16(name.len() as u16 + 3)); // server_name_list
    out.push(0x00); // name_type host_name
    out.extend_from_slice(&be16(name.len() as u16));
    out.extend_from_slice(name.as_bytes());
    out
}

/// Complete server_name extension (type + length + data).
pub(crate) fn sni_extension(name: &str) -> Vec<u8> {
    let data = sni_ext_data(name);
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(&be16(0x0000));
    out.extend_from_slice(&be16(data.len() as u16));
    out.extend_from_slice(&data);
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Response frame parsing (for live callbacks)
// ─────────────────────────────────────────────────────────────────────────────

/// Transport slice of a parsed frame.
pub enum Transport<'a> {
    Tcp {
        sport: u16,
        dport: u16,
        flags: u8,
        payload: &'a [u8],
    },
    Udp {
        sport: u16,
        dport: u16,
        payload: &'a [u8],
    },
    Other,
}

/// Minimal view of a captured Ethernet frame.
pub struct Frame<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub transport: Transport<'a>,
}

/// Parse an Ethernet/IPv4 or Ethernet/IPv6 frame down to the transport
/// payload. Extension headers and non-TCP/UDP protocols come back as
/// [`Transport::Other`]; anything truncated returns `None`.
pub fn parse_frame(data: &[u8]) -> Option<Frame<'_>> {
    if data.len() < 14 {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    let (src, dst, proto, l4): (IpAddr, IpAddr, u8, &[u8]) = match ethertype {
        0x0800 => {
            let ip = &data[14..];
            if ip.len() < 20 || ip[0] >> 4 != 4 {
                return None;
            }
            let ihl = ((ip[0] & 0x0f) as usize) * 4;
            if ip.len() < ihl {
                return None;
            }
            let src = IpAddr::from(<[u8; 4]>::try_from(&ip[12..16]).ok()?);
            let dst = IpAddr::from(<[u8; 4]>::try_from(&ip[16..20]).ok()?);
            (src, dst, ip[9], &ip[ihl..])
        }
        0x86dd => {
            let ip = &data[14..];
            if ip.len() < 40 || ip[0] >> 4 != 6 {
                return None;
            }
            let src = IpAddr::from(<[u8; 16]>::try_from(&ip[8..24]).ok()?);
            let dst = IpAddr::from(<[u8; 16]>::try_from(&ip[24..40]).ok()?);
            (src, dst, ip[6], &ip[40..])
        }
        _ => return None,
    };

    let transport = match proto {
        6 if l4.len() >= 20 => {
            let off = ((l4[12] >> 4) as usize) * 4;
            if l4.len() < off {
                Transport::Other
            } else {
                Transport::Tcp {
                    sport: u16::from_be_bytes([l4[0], l4[1]]),
                    dport: u16::from_be_bytes([l4[2], l4[3]]),
                    flags: l4[13],
                    payload: &l4[off..],
                }
            }
        }
        17 if l4.len() >= 8 => Transport::Udp {
            sport: u16::from_be_bytes([l4[0], l4[1]]),
            dport: u16::from_be_bytes([l4[2], l4[3]]),
            payload: &l4[8..],
        },
        _ => Transport::Other,
    };

    Some(Frame { src, dst, transport })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
