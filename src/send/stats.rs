//! Send-side counters: cumulative and per-epoch packets, bytes, and errors.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Default)]
struct Counters {
    /// packets per epoch
    ppe: u64,
    /// bytes per epoch
    bpe: u64,
    /// errors per epoch
    epe: u64,
    /// packets total
    pt: u64,
    /// bytes total
    bt: u64,
    /// errors total
    et: u64,
}

/// Mutex-guarded send statistics.
///
/// Workers increment on every send attempt; the reporter snapshots and
/// resets the epoch counters on its interval.
pub struct SendStats {
    start: Instant,
    inner: Mutex<(Counters, Instant)>,
}

/// Point-in-time copy of the counters for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_total: u64,
    pub bytes_total: u64,
    pub errors_total: u64,
    pub packets_epoch: u64,
    pub bytes_epoch: u64,
    pub errors_epoch: u64,
}

impl SendStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            inner: Mutex::new((Counters::default(), now)),
        }
    }

    /// Record one successfully written packet of `n` bytes.
    pub fn record_packet(&self, n: usize) {
        let mut guard = self.inner.lock().expect("stats poisoned");
        let c = &mut guard.0;
        c.ppe += 1;
        c.pt += 1;
        c.bpe += n as u64;
        c.bt += n as u64;
    }

    /// Record one dropped packet (exhausted retries or missing socket).
    pub fn record_error(&self) {
        let mut guard = self.inner.lock().expect("stats poisoned");
        guard.0.epe += 1;
        guard.0.et += 1;
    }

    /// Copy the current counters without resetting anything.
    pub fn snapshot(&self) -> StatsSnapshot {
        let guard = self.inner.lock().expect("stats poisoned");
        let c = &guard.0;
        StatsSnapshot {
            packets_total: c.pt,
            bytes_total: c.bt,
            errors_total: c.et,
            packets_epoch: c.ppe,
            bytes_epoch: c.bpe,
            errors_epoch: c.epe,
        }
    }

    /// Log one stats line and start a new epoch.
    ///
    /// Line format: `stats <total_ms> <epoch_ms> <pt> <bt> <et> <pps> <bps> <eps>`.
    pub fn report_and_reset(&self) {
        let mut guard = self.inner.lock().expect("stats poisoned");
        let epoch_ms = (guard.1.elapsed().as_millis() as f64).max(1.0);
        let total_ms = (self.start.elapsed().as_millis() as f64).max(1.0);
        let c = &guard.0;

        tracing::info!(
            "stats {:.0} {:.0} {} {} {} {:.3} {:.3} {:.3}",
            total_ms,
            epoch_ms,
            c.pt,
            c.bt,
            c.et,
            c.ppe as f64 * 1000.0 / epoch_ms,
            c.bpe as f64 * 1000.0 / epoch_ms,
            c.epe as f64 * 1000.0 / epoch_ms,
        );

        guard.0.ppe = 0;
        guard.0.bpe = 0;
        guard.0.epe = 0;
        guard.1 = Instant::now();
    }
}

impl Default for SendStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = SendStats::new();
        stats.record_packet(100);
        stats.record_packet(50);
        stats.record_error();

        let s = stats.snapshot();
        assert_eq!(s.packets_total, 2);
        assert_eq!(s.bytes_total, 150);
        assert_eq!(s.errors_total, 1);
        assert_eq!(s.packets_epoch, 2);
    }

    #[test]
    fn test_epoch_reset_preserves_totals() {
        let stats = SendStats::new();
        stats.record_packet(100);
        stats.record_error();
        stats.report_and_reset();
        stats.record_packet(10);

        let s = stats.snapshot();
        assert_eq!(s.packets_total, 2, "totals are monotonic");
        assert_eq!(s.errors_total, 1);
        assert_eq!(s.packets_epoch, 1, "epoch counter restarts after report");
        assert_eq!(s.bytes_epoch, 10);
        assert_eq!(s.errors_epoch, 0);
    }
}
