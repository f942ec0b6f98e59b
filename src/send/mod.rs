//! Packet transmission: source routing, raw-socket worker pool, rate
//! limiting, and the TCP/UDP framing layers.

pub mod packet;
pub mod rate;
pub mod raw;
pub mod route;
pub mod stats;
pub mod tcp;
pub mod udp;

/// Error from the framing and transmission layers.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No source address is configured for the destination's family.
    /// Per-send and non-fatal: the job is skipped.
    #[error("no {0} address available")]
    NoSourceForFamily(&'static str),

    /// Packet construction failed. Indicates a bug; the job is skipped.
    #[error("packet serialization failed: {0}")]
    Serialize(String),

    /// The raw sender's queue is gone (sender closed during shutdown).
    #[error("raw send queue closed")]
    QueueClosed,

    /// A dial-mode UDP send failed at the socket layer.
    #[error("{0}: udp socket error: {1}")]
    Socket(String, std::io::Error),
}
