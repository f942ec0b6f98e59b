//! Bidiprobe CLI.
//!
//! Usage:
//!   bidiprobe --type tls --domains domains.txt --ips targets.txt -d out/
//!   cat targets.txt | bidiprobe --type quic --pps 10k --verbose

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = bidiprobe::cli::Cli::parse();
    bidiprobe::cli::run(cli).await
}
