//! Raw-socket send engine.
//!
//! A worker pool draining a queue of fully-serialized IP packets into
//! `AF_INET`/`AF_INET6` `SOCK_RAW / IPPROTO_RAW` sockets. One file
//! descriptor per family is shared by every worker (the kernel serializes
//! `sendto` on the socket, so per-worker descriptors add nothing). An
//! optional packet- or byte-rate limit is spliced between the public queue
//! and the workers.
//!
//! `IPPROTO_RAW` implies `IP_HDRINCL`: the kernel transmits the caller's IP
//! header verbatim, which is exactly what the framers produce.

use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::rate;
use super::stats::{SendStats, StatsSnapshot};
use crate::send::SendError;

/// Transient-error retry policy for `sendto`.
const SEND_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Error from raw sender construction.
#[derive(Debug, thiserror::Error)]
pub enum RawSocketError {
    #[error("raw socket unavailable (requires CAP_NET_RAW): {0}")]
    Unavailable(std::io::Error),

    #[error("bad rate limit: {0}")]
    Limit(#[from] rate::LimitError),
}

/// One queued message: destination plus a fully-formed IP packet.
pub struct Msg {
    pub ip: IpAddr,
    pub payload: Vec<u8>,
}

/// Raw-socket sender: shared v4/v6 descriptors behind a worker pool.
pub struct RawSender {
    queue: std::sync::Mutex<Option<mpsc::Sender<Msg>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    fds: std::sync::Mutex<Option<(RawFd, Option<RawFd>)>>,
    stats: Arc<SendStats>,
}

impl RawSender {
    /// Open the raw sockets and start `n_workers` send workers with an
    /// optional rate limit. A non-empty `bps` selects byte mode; otherwise
    /// `pps` applies in count mode (empty string = unlimited).
    ///
    /// The IPv4 socket is required. An IPv6 socket failure is tolerated:
    /// the sender degrades and drops v6 packets with an error count.
    ///
    /// # Errors
    /// [`RawSocketError::Unavailable`] when the v4 socket cannot be opened,
    /// [`RawSocketError::Limit`] for an unparseable rate string.
    pub fn new(n_workers: usize, pps: &str, bps: &str) -> Result<Self, RawSocketError> {
        // Validate the limit strings before any descriptor is opened.
        rate::parse_limit(pps)?;
        rate::parse_limit(bps)?;

        let fd4 = open_raw_socket(libc::AF_INET).map_err(RawSocketError::Unavailable)?;
        let fd6 = match open_raw_socket(libc::AF_INET6) {
            Ok(fd) => Some(fd),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open IPv6 raw socket - v6 sends will be dropped");
                None
            }
        };

        let (in_tx, in_rx) = mpsc::channel::<Msg>(n_workers.max(1));
        let (out_tx, out_rx) = mpsc::channel::<Msg>(n_workers.max(1));
        if !bps.is_empty() {
            rate::limit(bps, in_rx, out_tx, Some(|m: &Msg| m.payload.len() as i64))?;
        } else {
            // Empty pps runs the splice in unlimited mode.
            rate::limit(pps, in_rx, out_tx, None::<fn(&Msg) -> i64>)?;
        }

        let stats = Arc::new(SendStats::new());
        let out_rx = Arc::new(tokio::sync::Mutex::new(out_rx));
        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers.max(1) {
            let rx = Arc::clone(&out_rx);
            let stats = Arc::clone(&stats);
            workers.push(tokio::spawn(async move {
                loop {
                    let msg = { rx.lock().await.recv().await };
                    let Some(msg) = msg else { return };
                    send_one(fd4, fd6, &msg, &stats).await;
                }
            }));
        }

        Ok(Self {
            queue: std::sync::Mutex::new(Some(in_tx)),
            workers: tokio::sync::Mutex::new(workers),
            fds: std::sync::Mutex::new(Some((fd4, fd6))),
            stats,
        })
    }

    /// Enqueue one packet. Fire-and-forget; blocks only while the rate
    /// limiter is throttling the queue.
    pub async fn send(&self, ip: IpAddr, payload: Vec<u8>) -> Result<(), SendError> {
        let tx = self.queue.lock().expect("queue poisoned").clone();
        let Some(tx) = tx else {
            return Err(SendError::QueueClosed);
        };
        tx.send(Msg { ip, payload })
            .await
            .map_err(|_| SendError::QueueClosed)
    }

    /// Snapshot of the cumulative counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Handle to the live counters (for the periodic reporter).
    pub fn stats_handle(&self) -> Arc<SendStats> {
        Arc::clone(&self.stats)
    }

    /// Drain the queue, stop the workers, and close the sockets.
    /// Idempotent; later sends fail with [`SendError::QueueClosed`].
    pub async fn close(&self) {
        drop(self.queue.lock().expect("queue poisoned").take());
        let mut workers = self.workers.lock().await;
        for h in workers.drain(..) {
            let _ = h.await;
        }
        if let Some((fd4, fd6)) = self.fds.lock().expect("fds poisoned").take() {
            unsafe {
                libc::close(fd4);
                if let Some(fd6) = fd6 {
                    libc::close(fd6);
                }
            }
        }
    }
}

fn open_raw_socket(family: libc::c_int) -> Result<RawFd, std::io::Error> {
    let fd = unsafe { libc::socket(family, libc::SOCK_RAW, libc::IPPROTO_RAW) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

/// Family-appropriate destination address for `sendto`.
enum SockAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl SockAddr {
    fn for_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(dst) => SockAddr::V4(libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    // in_addr is network byte order in memory.
                    s_addr: u32::from_ne_bytes(dst.octets()),
                },
                sin_zero: [0; 8],
            }),
            IpAddr::V6(dst) => SockAddr::V6(libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: 0,
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: dst.octets(),
                },
                sin6_scope_id: 0,
            }),
        }
    }

    /// One `sendto` attempt. Kept synchronous so no raw pointer lives
    /// across an await point.
    fn sendto(&self, fd: RawFd, payload: &[u8]) -> libc::ssize_t {
        let (addr, addr_len) = match self {
            SockAddr::V4(a) => (
                a as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            SockAddr::V6(a) => (
                a as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            ),
        };
        unsafe {
            libc::sendto(
                fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                addr,
                addr_len,
            )
        }
    }
}

/// Write one packet, retrying transient failures, and count the outcome.
async fn send_one(fd4: RawFd, fd6: Option<RawFd>, msg: &Msg, stats: &SendStats) {
    let fd = match msg.ip {
        IpAddr::V4(_) => fd4,
        IpAddr::V6(_) => {
            let Some(fd6) = fd6 else {
                stats.record_error();
                return;
            };
            fd6
        }
    };

    match sendto_retry(fd, &msg.payload, &SockAddr::for_ip(msg.ip)).await {
        Ok(()) => stats.record_packet(msg.payload.len()),
        Err(e) => {
            stats.record_error();
            tracing::debug!(dst = %msg.ip, error = %e, "sendto failed after retries");
        }
    }
}

async fn sendto_retry(fd: RawFd, payload: &[u8], addr: &SockAddr) -> Result<(), std::io::Error> {
    let mut last = std::io::Error::from_raw_os_error(libc::EAGAIN);
    for _ in 0..SEND_RETRIES {
        if addr.sendto(fd, payload) >= 0 {
            return Ok(());
        }
        last = std::io::Error::last_os_error();
        tokio::time::sleep(RETRY_DELAY).await;
    }
    Err(last)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
