//! Response capture pipeline.
//!
//! One consumer thread per probe type: a live pcap handle with a per-probe
//! BPF filter, every matching frame appended to a gzipped legacy-pcap
//! stream, and an optional callback for live result printing. The handle
//! runs with a read timeout so a stop flag can interrupt an idle capture;
//! on stop the gzip stream is flushed and closed cleanly.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flate2::{Compression, GzBuilder};

use crate::probes::PacketCallback;

/// Capture snapshot length; also recorded in the pcap file header.
pub const SNAPLEN: i32 = 1600;

/// pcap linktype for Ethernet.
const LINKTYPE_ETHERNET: u32 = 1;

/// Poll granularity for the stop flag while the handle is idle.
const READ_TIMEOUT_MS: i32 = 1000;

/// Error from capture setup.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("interface {0:?} not present")]
    InterfaceMissing(String),

    #[error("pcap open failed: {0}")]
    Open(#[from] pcap::Error),

    #[error("capture output: {0}")]
    Io(#[from] std::io::Error),
}

/// Verify the capture interface exists before any worker starts.
pub fn check_interface(iface: &str) -> Result<(), CaptureError> {
    let devices = pcap::Device::list()?;
    if devices.iter().any(|d| d.name == iface) {
        Ok(())
    } else {
        Err(CaptureError::InterfaceMissing(iface.to_string()))
    }
}

/// Handle to a running capture consumer.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Open the capture and start the consumer thread.
    ///
    /// The output is `<out_dir>/<probe_name>.pcap.gz` with the uncompressed
    /// name embedded in the gzip header. A pcap-open or BPF-compile failure
    /// is returned here and is fatal only for this worker.
    pub fn spawn(
        iface: &str,
        out_dir: &Path,
        probe_name: &str,
        bpf_filter: &str,
        callback: Option<PacketCallback>,
    ) -> Result<Self, CaptureError> {
        let pcap_name = format!("{probe_name}.pcap");
        let file = File::create(out_dir.join(format!("{pcap_name}.gz")))?;
        let writer = GzBuilder::new()
            .filename(pcap_name.as_str())
            .write(BufWriter::new(file), Compression::default());

        let mut cap = pcap::Capture::from_device(iface)?
            .snaplen(SNAPLEN)
            .promisc(true)
            .immediate_mode(true)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        cap.filter(bpf_filter, true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let probe = probe_name.to_string();
        let handle = std::thread::spawn(move || {
            consume(cap, writer, &stop_flag, callback, &probe);
        });

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the consumer and wait for the pcap stream to flush.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn consume<W: Write>(
    mut cap: pcap::Capture<pcap::Active>,
    writer: flate2::write::GzEncoder<W>,
    stop: &AtomicBool,
    callback: Option<PacketCallback>,
    probe: &str,
) {
    let mut writer = writer;
    if let Err(e) = write_file_header(&mut writer) {
        tracing::error!(probe, error = %e, "failed to start pcap stream");
        return;
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match cap.next_packet() {
            Ok(packet) => {
                if let Err(e) = write_packet(&mut writer, &packet) {
                    tracing::error!(probe, error = %e, "pcap write failed");
                    break;
                }
                if let Some(cb) = &callback {
                    cb(packet.data);
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                tracing::error!(probe, error = %e, "capture read failed");
                break;
            }
        }
    }

    tracing::info!(probe, "closing pcap handler");
    match writer.finish() {
        Ok(mut inner) => {
            if let Err(e) = inner.flush() {
                tracing::error!(probe, error = %e, "pcap flush failed");
            }
        }
        Err(e) => tracing::error!(probe, error = %e, "pcap flush failed"),
    }
}

/// Legacy pcap global header: magic, version 2.4, snaplen, Ethernet.
fn write_file_header<W: Write>(w: &mut W) -> std::io::Result<()> {
    let mut hdr = [0u8; 24];
    hdr[0..4].copy_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    hdr[4..6].copy_from_slice(&2u16.to_le_bytes());
    hdr[6..8].copy_from_slice(&4u16.to_le_bytes());
    // thiszone and sigfigs stay zero.
    hdr[16..20].copy_from_slice(&(SNAPLEN as u32).to_le_bytes());
    hdr[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    w.write_all(&hdr)
}

/// Per-record header (ts_sec, ts_usec, incl_len, orig_len) plus the frame.
fn write_packet<W: Write>(w: &mut W, packet: &pcap::Packet<'_>) -> std::io::Result<()> {
    let mut hdr = [0u8; 16];
    hdr[0..4].copy_from_slice(&(packet.header.ts.tv_sec as u32).to_le_bytes());
    hdr[4..8].copy_from_slice(&(packet.header.ts.tv_usec as u32).to_le_bytes());
    hdr[8..12].copy_from_slice(&packet.header.caplen.to_le_bytes());
    hdr[12..16].copy_from_slice(&packet.header.len.to_le_bytes());
    w.write_all(&hdr)?;
    w.write_all(packet.data)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn fake_packet<'a>(header: &'a pcap::PacketHeader, data: &'a [u8]) -> pcap::Packet<'a> {
        pcap::Packet { header, data }
    }

    #[test]
    fn test_file_header_layout() {
        let mut buf = Vec::new();
        write_file_header(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..4], &0xa1b2_c3d4u32.to_le_bytes(), "pcap magic");
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 2, "major version");
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 4, "minor version");
        assert_eq!(
            u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            1600,
            "snaplen"
        );
        assert_eq!(
            u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            1,
            "LINKTYPE_ETHERNET"
        );
    }

    #[test]
    fn test_packet_record_layout() {
        let header = pcap::PacketHeader {
            ts: libc::timeval {
                tv_sec: 1_700_000_000,
                tv_usec: 123_456,
            },
            caplen: 4,
            len: 60,
        };
        let mut buf = Vec::new();
        write_packet(&mut buf, &fake_packet(&header, &[0xde, 0xad, 0xbe, 0xef])).unwrap();

        assert_eq!(buf.len(), 20);
        assert_eq!(
            u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            1_700_000_000
        );
        assert_eq!(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]), 4);
        assert_eq!(
            u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            60,
            "original length survives truncation"
        );
        assert_eq!(&buf[16..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_gzip_stream_round_trips() {
        let mut gz = GzBuilder::new()
            .filename("test.pcap")
            .write(Vec::new(), Compression::default());
        write_file_header(&mut gz).unwrap();
        let header = pcap::PacketHeader {
            ts: libc::timeval { tv_sec: 1, tv_usec: 2 },
            caplen: 3,
            len: 3,
        };
        write_packet(&mut gz, &fake_packet(&header, &[1, 2, 3])).unwrap();
        let compressed = gz.finish().unwrap();

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 24 + 16 + 3, "header + record + frame");
        assert_eq!(&out[0..4], &0xa1b2_c3d4u32.to_le_bytes());
    }

    #[test]
    fn test_missing_interface_rejected() {
        // Device listing itself may need privileges on some systems; only
        // assert when the list call succeeds.
        if pcap::Device::list().is_ok() {
            assert!(check_interface("definitely-not-a-real-iface0").is_err());
        }
    }
}
