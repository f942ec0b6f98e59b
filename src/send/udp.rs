//! UDP framing layer.
//!
//! Two interchangeable modes behind one interface: "dial" opens a connected
//! datagram socket bound to the configured source (the OS picks the port
//! when unset), "raw" mirrors the TCP framer and hand-builds UDP-over-IP
//! with a randomized IPv4 identification or IPv6 flow label.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use rand::Rng;

use super::packet::{self, IpPair};
use super::raw::RawSender;
use super::route::{self, RouteError};
use super::stats::SendStats;
use super::SendError;
use crate::SharedRng;

const V4_ROUTE_PROBE: &str = "1.2.3.4";
const V6_ROUTE_PROBE: &str = "2606:4700::";

/// How a UDP probe reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    /// Connected socket writes; kernel builds the headers.
    Dial,
    /// Hand-built UDP-over-IP through the raw-socket pool.
    Raw,
}

/// UDP sender with resolved source addresses.
pub struct UdpSender {
    mode: UdpMode,
    raw: Option<Arc<RawSender>>,
    /// Dial-mode counters; raw mode counts in the raw sender instead.
    stats: Option<Arc<SendStats>>,
    src4: Option<IpAddr>,
    src6: Option<IpAddr>,
    checksums: bool,
    rng: SharedRng,
}

impl UdpSender {
    /// Build a dial-mode sender (no raw sockets needed).
    pub fn new_dial(laddr4: &str, laddr6: &str, rng: SharedRng) -> Result<Self, RouteError> {
        let (src4, src6) = resolve_sources(laddr4, laddr6)?;
        Ok(Self {
            mode: UdpMode::Dial,
            raw: None,
            stats: Some(Arc::new(SendStats::new())),
            src4,
            src6,
            checksums: true,
            rng,
        })
    }

    /// Dial-mode counters, when this sender owns them.
    pub fn stats_handle(&self) -> Option<Arc<SendStats>> {
        self.stats.clone()
    }

    /// Build a raw-mode sender on top of an existing raw-socket pool.
    pub fn new_raw(
        raw: Arc<RawSender>,
        laddr4: &str,
        laddr6: &str,
        checksums: bool,
        rng: SharedRng,
    ) -> Result<Self, RouteError> {
        let (src4, src6) = resolve_sources(laddr4, laddr6)?;
        Ok(Self {
            mode: UdpMode::Raw,
            raw: Some(raw),
            stats: None,
            src4,
            src6,
            checksums,
            rng,
        })
    }

    /// Send `payload` to `dst:dport` from `sport` (zero = pick one).
    ///
    /// Returns the source port actually used, which the caller logs and the
    /// capture side uses for attribution.
    pub async fn send(
        &self,
        dst: IpAddr,
        dport: u16,
        sport: u16,
        payload: &[u8],
    ) -> Result<u16, SendError> {
        match self.mode {
            UdpMode::Dial => self.send_dial(dst, dport, sport, payload),
            UdpMode::Raw => self.send_raw(dst, dport, sport, payload).await,
        }
    }

    fn send_dial(
        &self,
        dst: IpAddr,
        dport: u16,
        sport: u16,
        payload: &[u8],
    ) -> Result<u16, SendError> {
        let src = self.source_for(dst)?;
        let dst_sock = SocketAddr::new(dst, dport);
        let label = dst_sock.to_string();

        let result = (|| {
            let sock = UdpSocket::bind(SocketAddr::new(src, sport))?;
            sock.connect(dst_sock)?;
            sock.send(payload)?;
            sock.local_addr()
        })();

        match result {
            Ok(local) => {
                if let Some(stats) = &self.stats {
                    stats.record_packet(payload.len());
                }
                Ok(local.port())
            }
            Err(e) => {
                if let Some(stats) = &self.stats {
                    stats.record_error();
                }
                Err(SendError::Socket(label, e))
            }
        }
    }

    async fn send_raw(
        &self,
        dst: IpAddr,
        dport: u16,
        sport: u16,
        payload: &[u8],
    ) -> Result<u16, SendError> {
        let src = self.source_for(dst)?;
        let raw = self.raw.as_ref().ok_or(SendError::QueueClosed)?;

        let (sport, id, flow_label) = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            let sport = if sport == 0 {
                rng.gen_range(1000..=65535)
            } else {
                sport
            };
            (sport, rng.gen::<u16>(), rng.gen::<u32>() & 0x000f_ffff)
        };

        let mut ip = IpPair::new(src, dst);
        ip.id = id;
        ip.flow_label = flow_label;
        let pkt = packet::build_udp_packet(&ip, sport, dport, payload, self.checksums);

        raw.send(dst, pkt).await?;
        Ok(sport)
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

fn resolve_sources(laddr4: &str, laddr6: &str) -> Result<(Option<IpAddr>, Option<IpAddr>), RouteError> {
    let src4 = route::resolve_source(laddr4, V4_ROUTE_PROBE.parse().expect("literal"))?;
    let src6 = match route::resolve_source(laddr6, V6_ROUTE_PROBE.parse().expect("literal")) {
        Ok(ip) => Some(ip),
        Err(e) => {
            tracing::warn!(error = %e, "failed to init IPv6 - likely not supported");
            None
        }
    };
    Ok((Some(src4), src6))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
