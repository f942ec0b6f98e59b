//! Token-bucket rate limiting as a channel splice.
//!
//! The limiter sits between a producer channel and a consumer channel:
//! `in -> bucket -> out`. A ticker refills the budget every period; once the
//! budget is spent, reads from the input channel stall until the next tick,
//! which transitively blocks producers. Units are either element counts or
//! a per-element cost (e.g. payload bytes).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Error from parsing a human-readable limit string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("unable to parse provided limit string: {0:?}")]
    Unparseable(String),
}

/// Parse a human-readable rate limit.
///
/// Accepts floating-point magnitudes with optional binary suffixes
/// `k` (2^10), `M` (2^20), `G` (2^30). The empty string means unlimited and
/// yields `(0, 0)`, which [`limit`] treats as a direct forwarder.
pub fn parse_limit(s: &str) -> Result<(i64, Duration), LimitError> {
    if s.is_empty() {
        return Ok((0, Duration::ZERO));
    }

    let (mag, shift) = match s.as_bytes()[s.len() - 1] {
        b'k' => (&s[..s.len() - 1], 1i64 << 10),
        b'M' => (&s[..s.len() - 1], 1i64 << 20),
        b'G' => (&s[..s.len() - 1], 1i64 << 30),
        _ => (s, 1),
    };

    match mag.parse::<f64>() {
        Ok(v) => Ok(((v * shift as f64) as i64, Duration::from_secs(1))),
        Err(_) => Err(LimitError::Unparseable(s.to_string())),
    }
}

/// Splice `rx` into `tx` under a limit parsed from `rate`.
///
/// `cost` maps an element to its unit count; `None` counts every element as
/// one. Spawns the splice task and returns immediately.
///
/// Contract: close the input channel to stop; in-flight elements are
/// forwarded first. Closing the output while the input is open leaves the
/// task permanently blocked, so callers must close input first.
pub fn limit<T, F>(
    rate: &str,
    rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    cost: Option<F>,
) -> Result<(), LimitError>
where
    T: Send + 'static,
    F: Fn(&T) -> i64 + Send + 'static,
{
    let (max, period) = parse_limit(rate)?;
    limit_explicit(max, period, rx, tx, cost);
    Ok(())
}

/// Splice `rx` into `tx` with an explicit `max` per `period`.
///
/// `max <= 0` or a zero period degenerates to a direct forwarder.
pub fn limit_explicit<T, F>(
    max: i64,
    period: Duration,
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    cost: Option<F>,
) where
    T: Send + 'static,
    F: Fn(&T) -> i64 + Send + 'static,
{
    if max <= 0 || period.is_zero() {
        tokio::spawn(async move {
            while let Some(elem) = rx.recv().await {
                if tx.send(elem).await.is_err() {
                    return;
                }
            }
        });
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut spent: i64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    spent = 0;
                }
                elem = rx.recv(), if spent < max => {
                    let Some(elem) = elem else { return };
                    let n = cost.as_ref().map_or(1, |f| f(&elem));
                    if tx.send(elem).await.is_err() {
                        return;
                    }
                    spent += n;
                }
            }
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit_plain_number() {
        assert_eq!(parse_limit("100").unwrap(), (100, Duration::from_secs(1)));
    }

    #[test]
    fn test_parse_limit_kilo() {
        assert_eq!(parse_limit("2k").unwrap(), (2048, Duration::from_secs(1)));
    }

    #[test]
    fn test_parse_limit_fractional_giga() {
        assert_eq!(
            parse_limit("1.5G").unwrap(),
            (1_610_612_736, Duration::from_secs(1))
        );
    }

    #[test]
    fn test_parse_limit_mega() {
        assert_eq!(
            parse_limit("4M").unwrap(),
            (4 * 1024 * 1024, Duration::from_secs(1))
        );
    }

    #[test]
    fn test_parse_limit_empty_is_unlimited() {
        assert_eq!(parse_limit("").unwrap(), (0, Duration::ZERO));
    }

    #[test]
    fn test_parse_limit_garbage_fails() {
        assert!(parse_limit("10x").is_err());
        assert!(parse_limit("fast").is_err());
    }

    #[tokio::test]
    async fn test_unlimited_forwards_everything() {
        let (in_tx, in_rx) = mpsc::channel::<u32>(16);
        let (out_tx, mut out_rx) = mpsc::channel::<u32>(16);
        limit("", in_rx, out_tx, None::<fn(&u32) -> i64>).unwrap();

        for i in 0..10u32 {
            in_tx.send(i).await.unwrap();
        }
        drop(in_tx);

        let mut got = Vec::new();
        while let Some(v) = out_rx.recv().await {
            got.push(v);
        }
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_limit_two_per_second() {
        let (in_tx, in_rx) = mpsc::channel::<u32>(16);
        let (out_tx, mut out_rx) = mpsc::channel::<u32>(16);
        limit_explicit(
            2,
            Duration::from_secs(1),
            in_rx,
            out_tx,
            None::<fn(&u32) -> i64>,
        );

        for i in 0..10u32 {
            in_tx.send(i).await.unwrap();
        }
        drop(in_tx);

        let start = tokio::time::Instant::now();

        out_rx.recv().await.unwrap();
        out_rx.recv().await.unwrap();
        let third = out_rx.recv().await.unwrap();
        let at_third = start.elapsed();
        assert_eq!(third, 2);
        assert!(
            at_third >= Duration::from_millis(990) && at_third <= Duration::from_millis(1100),
            "third element must arrive on the first refill, got {at_third:?}"
        );

        out_rx.recv().await.unwrap();
        out_rx.recv().await.unwrap();
        let at_fifth = start.elapsed();
        assert!(
            at_fifth >= Duration::from_millis(1990) && at_fifth <= Duration::from_millis(2100),
            "fifth element must arrive on the second refill, got {at_fifth:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_limit_uses_cost_function() {
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(16);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
        limit_explicit(
            100,
            Duration::from_secs(1),
            in_rx,
            out_tx,
            Some(|m: &Vec<u8>| m.len() as i64),
        );

        // Two 60-byte messages: the first fits the epoch, the second spends
        // past the budget, the third must wait for the refill.
        for _ in 0..3 {
            in_tx.send(vec![0u8; 60]).await.unwrap();
        }
        drop(in_tx);

        let start = tokio::time::Instant::now();
        out_rx.recv().await.unwrap();
        out_rx.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        out_rx.recv().await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(990),
            "third message must wait for the next epoch"
        );
    }

    #[tokio::test]
    async fn test_closing_input_drains_and_stops() {
        let (in_tx, in_rx) = mpsc::channel::<u32>(16);
        let (out_tx, mut out_rx) = mpsc::channel::<u32>(16);
        limit_explicit(1000, Duration::from_secs(1), in_rx, out_tx, None::<fn(&u32) -> i64>);

        in_tx.send(7).await.unwrap();
        drop(in_tx);

        assert_eq!(out_rx.recv().await, Some(7));
        assert_eq!(out_rx.recv().await, None, "output must close after input");
    }
}
