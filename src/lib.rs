//! Bidiprobe — bidirectional censorship measurement engine.
//!
//! Injects crafted application-layer probes (DNS, HTTP, TLS, uTLS, QUIC,
//! DTLS) at target hosts over raw sockets and captures any return traffic
//! so that injected middlebox responses can be attributed to the probe that
//! triggered them. Usable as a library or via the CLI.

pub mod capture;
pub mod cli;
pub mod engine;
pub mod probes;
pub mod send;
pub mod track;

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Re-export key backend types for library users.
pub use probes::{ProbeError, Prober};
pub use send::raw::RawSender;
pub use send::tcp::TcpSender;
pub use send::udp::UdpSender;
pub use track::KeyTable;

// ─────────────────────────────────────────────────────────────────────────────
// Probe job
// ─────────────────────────────────────────────────────────────────────────────

/// One unit of work for a probe worker: a target IP paired with a domain.
///
/// The IP is kept as the raw input string and parsed by the worker so that a
/// malformed line in the input list fails one job, not the whole run.
#[derive(Debug, Clone)]
pub struct Job {
    /// Domain to embed in the probe (SNI, Host header, QNAME, ...).
    pub domain: String,
    /// Target IP as read from the input list.
    pub ip: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared PRNG
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide PRNG handle.
///
/// All non-cryptographic randomness (source ports, client randoms, session
/// IDs, GREASE values) flows through one seeded generator so that `--seed`
/// reproduces a run's packet fields.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Create the shared PRNG from a seed.
pub fn seeded_rng(seed: u64) -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// Draw a source port uniformly from `[1000, 65535]`.
pub fn random_source_port(rng: &SharedRng) -> u16 {
    rng.lock().expect("rng poisoned").gen_range(1000..=65535)
}

/// Fill a buffer from the shared PRNG.
pub fn fill_random(rng: &SharedRng, buf: &mut [u8]) {
    rng.lock().expect("rng poisoned").fill(buf);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = seeded_rng(42);
        let b = seeded_rng(42);
        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        fill_random(&a, &mut buf_a);
        fill_random(&b, &mut buf_b);
        assert_eq!(buf_a, buf_b, "same seed must yield the same byte stream");
    }

    #[test]
    fn test_random_source_port_in_range() {
        let rng = seeded_rng(7);
        for _ in 0..1000 {
            let p = random_source_port(&rng);
            assert!((1000..=65535).contains(&p), "port {p} outside [1000, 65535]");
        }
    }
}
