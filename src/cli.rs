//! CLI entrypoint: flag surface, input loading, component wiring, and the
//! shutdown sequence (jobs drain, capture flush, socket close).

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use crate::capture::{self, CaptureWorker};
use crate::engine::{self, RunConfig};
use crate::probes::dns::DnsProber;
use crate::probes::dtls::{self, DtlsProber};
use crate::probes::http::HttpProber;
use crate::probes::quic::QuicProber;
use crate::probes::tls::TlsProber;
use crate::probes::utls::UtlsProber;
use crate::probes::Prober;
use crate::send::raw::RawSender;
use crate::send::stats::SendStats;
use crate::send::tcp::{TcpOptions, TcpSender};
use crate::send::udp::UdpSender;
use crate::track::{domain_key_table, KeyTable};
use crate::{seeded_rng, SharedRng};

/// Workers draining the raw-socket queue.
const RAW_SEND_WORKERS: usize = 20;

/// Probe protocol selector.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    Dns,
    Http,
    Tls,
    Utls,
    Quic,
    Dtls,
}

/// Bidiprobe — bidirectional censorship measurement engine.
#[derive(Parser, Debug)]
#[command(name = "bidiprobe", version, about)]
#[command(
    long_about = "Injects crafted DNS/HTTP/TLS/uTLS/QUIC/DTLS probes at target hosts over raw \
    sockets and captures responses (RSTs, ICMP errors, DNS answers) for attribution. \
    Requires CAP_NET_RAW for TCP/QUIC/DTLS probe types and capture."
)]
pub struct Cli {
    /// Number of probe worker tasks
    #[arg(long, default_value_t = 50)]
    pub workers: usize,

    /// Duration a worker waits after sending a probe (e.g. 5s, 500ms)
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub wait: Duration,

    /// Print per-send log lines
    #[arg(long)]
    pub verbose: bool,

    /// File with one probe domain per line
    #[arg(long, default_value = "domains.txt")]
    pub domains: PathBuf,

    /// File with control domains, probed alongside the domain list
    #[arg(long, default_value = "ctrls.txt")]
    pub controls: PathBuf,

    /// File with one target IP per line; empty reads from stdin
    #[arg(long, default_value = "")]
    pub ips: String,

    /// Interface to capture on
    #[arg(long, default_value = "eth0")]
    pub iface: String,

    /// Source IPv4 address; empty uses the route-preferred source
    #[arg(long, default_value = "")]
    pub laddr: String,

    /// Source IPv6 address; empty uses the route-preferred source
    #[arg(long, default_value = "")]
    pub laddr6: String,

    /// Probe type to send
    #[arg(long = "type", value_enum, default_value = "dns")]
    pub probe_type: ProbeType,

    /// PRNG seed for generated packet fields; -1 seeds from the clock
    #[arg(long, default_value_t = -1)]
    pub seed: i64,

    /// Disable the SYN and ACK warm-up packets for TCP probe types
    #[arg(long)]
    pub nsa: bool,

    /// Delay between SYN, ACK and data when the warm-up is enabled
    #[arg(long = "syn-delay", default_value = "2ms", value_parser = parse_duration)]
    pub syn_delay: Duration,

    /// Skip L4 checksums on injected packets
    #[arg(long = "no-checksums")]
    pub no_checksums: bool,

    /// Output directory (log, key table, pcaps)
    #[arg(short = 'd', long = "dir", default_value = "out/")]
    pub out_dir: PathBuf,

    /// Packets-per-second limit (e.g. 10k); empty is unlimited
    #[arg(long, default_value = "")]
    pub pps: String,

    /// Bytes-per-second limit (e.g. 4M); empty is unlimited
    #[arg(long, default_value = "")]
    pub bps: String,

    /// DNS query type (1 = A, 28 = AAAA)
    #[arg(long, default_value_t = 1)]
    pub qtype: u16,

    /// Suppress the DTLS SNI extension
    #[arg(long = "no-sni")]
    pub no_sni: bool,

    /// Randomize the DTLS destination port
    #[arg(long)]
    pub rdrstport: bool,

    /// DTLS destination port range when randomized
    #[arg(long = "dstPortRange", default_value = "1000-65535")]
    pub dst_port_range: String,
}

/// Parse a duration like `5s`, `2ms`, `1.5m`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let (mag, scale) = if let Some(m) = s.strip_suffix("ms") {
        (m, 1e-3)
    } else if let Some(m) = s.strip_suffix('s') {
        (m, 1.0)
    } else if let Some(m) = s.strip_suffix('m') {
        (m, 60.0)
    } else if let Some(m) = s.strip_suffix('h') {
        (m, 3600.0)
    } else {
        (s, 1.0)
    };
    let v: f64 = mag
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    if v < 0.0 {
        return Err(format!("invalid duration: {s:?}"));
    }
    Ok(Duration::from_secs_f64(v * scale))
}

/// Read non-empty lines from a file.
pub fn load_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let file = File::open(path)?;
    read_lines(BufReader::new(file))
}

fn read_lines<R: BufRead>(reader: R) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// Writer that tees log lines to stderr and the run's `log.out`.
struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        self.file.lock().expect("log poisoned").write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file.lock().expect("log poisoned").flush()
    }
}

fn init_logging(out_dir: &Path) -> anyhow::Result<()> {
    let log_file = File::options()
        .create(true)
        .append(true)
        .open(out_dir.join("log.out"))
        .context("opening log.out")?;
    let log_file = Arc::new(Mutex::new(log_file));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(move || TeeWriter {
            file: Arc::clone(&log_file),
        })
        .init();
    Ok(())
}

/// Run the orchestrator to completion.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating output dir {:?}", cli.out_dir))?;
    init_logging(&cli.out_dir)?;

    let seed = if cli.seed == -1 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as i64)
            .unwrap_or(1)
    } else {
        cli.seed
    };
    tracing::info!("Using seed: {seed}");
    let rng = seeded_rng(seed as u64);

    // Inputs: probe domains (+ controls) and target IPs.
    let mut domains = load_lines(&cli.domains)
        .with_context(|| format!("reading domains {:?}", cli.domains))?;
    match load_lines(&cli.controls) {
        Ok(controls) => domains.extend(controls),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound
            && cli.controls == PathBuf::from("ctrls.txt") =>
        {
            tracing::warn!("no control file at default path, continuing without controls");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading controls {:?}", cli.controls));
        }
    }
    tracing::info!("Read {} domains", domains.len());

    let ips = if cli.ips.is_empty() {
        read_lines(std::io::stdin().lock()).context("reading ips from stdin")?
    } else {
        load_lines(Path::new(&cli.ips)).with_context(|| format!("reading ips {:?}", cli.ips))?
    };
    tracing::info!("Read {} ips", ips.len());

    capture::check_interface(&cli.iface).with_context(|| format!("interface {:?}", cli.iface))?;

    // Every domain gets a unique source port before probing starts.
    let dkt = Arc::new(domain_key_table(&domains, &rng).context("populating key table")?);
    write_key_table(&cli.out_dir, &dkt)?;

    let setup = build_prober(&cli, Arc::clone(&dkt), rng.clone())?;
    let prober = Arc::new(setup.prober);

    let capture_worker = match CaptureWorker::spawn(
        &cli.iface,
        &cli.out_dir,
        prober.name(),
        prober.bpf_filter(),
        prober.packet_callback(),
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            // Fatal for the capture worker only; probes still go out.
            tracing::error!(error = %e, "capture disabled");
            None
        }
    };

    let reporter = engine::spawn_stats_reporter(Arc::clone(&setup.stats));

    let cfg = RunConfig {
        workers: cli.workers,
        wait: cli.wait,
        verbose: cli.verbose,
    };
    let n_jobs = engine::run(Arc::clone(&prober), &domains, &ips, &cfg).await;
    tracing::info!("drained {n_jobs} jobs");

    // Shutdown order: workers already drained; flush capture, then close
    // the raw sockets.
    if let Some(w) = capture_worker {
        w.stop();
    }
    reporter.abort();
    setup.stats.report_and_reset();
    if let Some(raw) = &setup.raw {
        raw.close().await;
    }
    Ok(())
}

struct ProberSetup {
    prober: Prober,
    /// Present when the probe type sends through raw sockets.
    raw: Option<Arc<RawSender>>,
    /// Counters driving the periodic stats line.
    stats: Arc<SendStats>,
}

fn build_prober(cli: &Cli, dkt: Arc<KeyTable<u16>>, rng: SharedRng) -> anyhow::Result<ProberSetup> {
    let tcp_opts = TcpOptions {
        syn: !cli.nsa,
        ack: !cli.nsa,
        syn_delay: cli.syn_delay,
        checksums: !cli.no_checksums,
    };

    let new_raw = || -> anyhow::Result<Arc<RawSender>> {
        Ok(Arc::new(
            RawSender::new(RAW_SEND_WORKERS, &cli.pps, &cli.bps).context("opening raw sockets")?,
        ))
    };
    let new_tcp = |raw: &Arc<RawSender>, rng: SharedRng| -> anyhow::Result<Arc<TcpSender>> {
        Ok(Arc::new(
            TcpSender::new(Arc::clone(raw), &cli.laddr, &cli.laddr6, rng)
                .context("resolving source addresses")?,
        ))
    };
    let new_udp_raw = |raw: &Arc<RawSender>, rng: SharedRng| -> anyhow::Result<Arc<UdpSender>> {
        Ok(Arc::new(
            UdpSender::new_raw(
                Arc::clone(raw),
                &cli.laddr,
                &cli.laddr6,
                !cli.no_checksums,
                rng,
            )
            .context("resolving source addresses")?,
        ))
    };

    match cli.probe_type {
        ProbeType::Dns => {
            let udp = Arc::new(
                UdpSender::new_dial(&cli.laddr, &cli.laddr6, rng.clone())
                    .context("resolving source addresses")?,
            );
            let stats = udp.stats_handle().expect("dial mode owns stats");
            Ok(ProberSetup {
                prober: Prober::Dns(DnsProber::new(udp, cli.qtype, rng)),
                raw: None,
                stats,
            })
        }
        ProbeType::Http => {
            let raw = new_raw()?;
            let tcp = new_tcp(&raw, rng.clone())?;
            let stats = raw.stats_handle();
            Ok(ProberSetup {
                prober: Prober::Http(HttpProber::new(tcp, dkt, tcp_opts)),
                raw: Some(raw),
                stats,
            })
        }
        ProbeType::Tls => {
            let raw = new_raw()?;
            let tcp = new_tcp(&raw, rng.clone())?;
            let stats = raw.stats_handle();
            Ok(ProberSetup {
                prober: Prober::Tls(TlsProber::new(tcp, dkt, tcp_opts, rng)),
                raw: Some(raw),
                stats,
            })
        }
        ProbeType::Utls => {
            let raw = new_raw()?;
            let tcp = new_tcp(&raw, rng.clone())?;
            let stats = raw.stats_handle();
            Ok(ProberSetup {
                prober: Prober::Utls(UtlsProber::new(tcp, dkt, tcp_opts, rng)),
                raw: Some(raw),
                stats,
            })
        }
        ProbeType::Quic => {
            let raw = new_raw()?;
            let udp = new_udp_raw(&raw, rng.clone())?;
            let stats = raw.stats_handle();
            Ok(ProberSetup {
                prober: Prober::Quic(QuicProber::new(udp, dkt, rng)),
                raw: Some(raw),
                stats,
            })
        }
        ProbeType::Dtls => {
            let range = if cli.rdrstport {
                Some(dtls::parse_port_range(&cli.dst_port_range)?)
            } else {
                None
            };
            let raw = new_raw()?;
            let udp = new_udp_raw(&raw, rng.clone())?;
            let stats = raw.stats_handle();
            Ok(ProberSetup {
                prober: Prober::Dtls(DtlsProber::new(udp, dkt, !cli.no_sni, range, rng)),
                raw: Some(raw),
                stats,
            })
        }
    }
}

fn write_key_table(out_dir: &Path, dkt: &KeyTable<u16>) -> anyhow::Result<()> {
    let mut file = File::create(out_dir.join("dkt.json")).context("creating dkt.json")?;
    dkt.marshal(&mut file).context("writing dkt.json")?;
    file.flush()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
