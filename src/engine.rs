//! Probe orchestration: a fixed-size worker pool consuming (domain, ip)
//! jobs, plus the periodic sender-statistics reporter.
//!
//! Jobs flow through a bounded channel (capacity 10x the worker count) so
//! enqueueing backpressures instead of buffering the whole cross product.
//! Each worker sends one probe and then sleeps `wait` before taking the
//! next job. Per-job failures are logged and never stop the run.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::probes::Prober;
use crate::send::stats::SendStats;
use crate::Job;

/// Interval between stats report lines.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Orchestrator parameters.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Sleep observed by each worker after a probe.
    pub wait: Duration,
    /// Log every successful send.
    pub verbose: bool,
}

/// Enumerate the full cross product, domains outermost.
pub fn job_list(domains: &[String], ips: &[String]) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(domains.len() * ips.len());
    for domain in domains {
        for ip in ips {
            jobs.push(Job {
                domain: domain.clone(),
                ip: ip.clone(),
            });
        }
    }
    jobs
}

/// Run every (domain, ip) pair through the prober and drain the pool.
///
/// Returns the number of jobs enqueued.
pub async fn run(prober: Arc<Prober>, domains: &[String], ips: &[String], cfg: &RunConfig) -> u64 {
    let workers = cfg.workers.max(1);
    let (tx, rx) = mpsc::channel::<Job>(workers * 10);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        let prober = Arc::clone(&prober);
        let wait = cfg.wait;
        let verbose = cfg.verbose;
        handles.push(tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { return };
                work_one(&prober, &job, verbose).await;
                tokio::time::sleep(wait).await;
            }
        }));
    }

    let mut n_jobs = 0u64;
    for job in job_list(domains, ips) {
        if tx.send(job).await.is_err() {
            break;
        }
        n_jobs += 1;
    }
    drop(tx);

    for handle in handles {
        let _ = handle.await;
    }
    n_jobs
}

async fn work_one(prober: &Prober, job: &Job, verbose: bool) {
    let addr: IpAddr = match job.ip.parse() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("Result {},{} - error: bad address: {e}", job.ip, job.domain);
            return;
        }
    };
    if let Err(e) = prober.send_probe(addr, &job.domain, verbose).await {
        tracing::warn!("Result {},{} - error: {e}", job.ip, job.domain);
    }
}

/// Spawn the 5-second stats reporter. Abort the returned handle at
/// shutdown; each tick prints cumulative totals and per-epoch rates.
pub fn spawn_stats_reporter(stats: Arc<SendStats>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            stats.report_and_reset();
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_list_is_full_cross_product() {
        let domains = vec!["a.com".to_string(), "b.com".to_string()];
        let ips = vec![
            "1.1.1.1".to_string(),
            "8.8.8.8".to_string(),
            "9.9.9.9".to_string(),
        ];
        let jobs = job_list(&domains, &ips);

        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs[0].domain, "a.com");
        assert_eq!(jobs[0].ip, "1.1.1.1");
        assert_eq!(jobs[2].ip, "9.9.9.9");
        assert_eq!(jobs[3].domain, "b.com", "domains iterate outermost");
    }

    #[test]
    fn test_job_list_empty_inputs() {
        assert!(job_list(&[], &["1.1.1.1".to_string()]).is_empty());
        assert!(job_list(&["a.com".to_string()], &[]).is_empty());
    }
}
