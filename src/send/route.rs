//! Source-address resolution.
//!
//! Uses the UDP connect trick: bind a datagram socket, connect it to the
//! destination (no packet is sent), and read back the local address the
//! kernel routing table selected. A requested local address wins when its
//! family matches the destination; a mismatched family is discarded so a
//! v4-only configuration can still probe v6 targets via the kernel default.

use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Error from source resolution.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route to {dst}: {err}")]
    Unavailable { dst: IpAddr, err: std::io::Error },
}

/// Resolve the source address to use when sending to `dst`.
///
/// `requested` is the operator-supplied local address (may be empty). The
/// rules, in order:
/// 1. Parse `requested`; discard it when its family differs from `dst`.
/// 2. Query the routing table for the preferred source toward `dst`.
/// 3. Return the surviving requested address, else the kernel-preferred one.
///
/// # Errors
/// [`RouteError::Unavailable`] when the routing lookup fails (no route or
/// family unsupported on this host).
pub fn resolve_source(requested: &str, dst: IpAddr) -> Result<IpAddr, RouteError> {
    let requested: Option<IpAddr> = requested.parse().ok();
    let requested = requested.filter(|ip| ip.is_ipv4() == dst.is_ipv4());

    let bind_addr: SocketAddr = if dst.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };

    let preferred = (|| -> std::io::Result<IpAddr> {
        let sock = UdpSocket::bind(bind_addr)?;
        // connect() consults the routing table; nothing is transmitted.
        sock.connect((dst, 53))?;
        Ok(sock.local_addr()?.ip())
    })()
    .map_err(|err| RouteError::Unavailable { dst, err })?;

    Ok(requested.unwrap_or(preferred))
}
