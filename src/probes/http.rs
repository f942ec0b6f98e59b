//! HTTP/1.1 GET probe.
//!
//! A fixed request template with the probed domain as the Host header, sent
//! to port 80 through the TCP framer (SYN+ACK prelude by default so
//! request-inspecting middleboxes see a plausible flow).

use std::net::IpAddr;
use std::sync::Arc;

use super::ProbeError;
use crate::send::tcp::{TcpOptions, TcpSender};
use crate::track::KeyTable;

const HTTP_PORT: u16 = 80;

/// Browser-like User-Agent carried by every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/103.0.0.0 Safari/537.36";

/// HTTP prober.
pub struct HttpProber {
    sender: Arc<TcpSender>,
    dkt: Arc<KeyTable<u16>>,
    opts: TcpOptions,
}

impl HttpProber {
    pub fn new(sender: Arc<TcpSender>, dkt: Arc<KeyTable<u16>>, opts: TcpOptions) -> Self {
        Self { sender, dkt, opts }
    }

    /// The literal request bytes for `name`.
    pub fn build_payload(name: &str) -> Vec<u8> {
        format!(
            "GET / HTTP/1.1\r\nHost: {name}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\n\r\n"
        )
        .into_bytes()
    }

    pub async fn send_probe(
        &self,
        ip: IpAddr,
        name: &str,
        verbose: bool,
    ) -> Result<(), ProbeError> {
        let payload = Self::build_payload(name);
        let sport = self.dkt.get(name).unwrap_or(0);
        let (seq_ack, sport) = self
            .sender
            .send(ip, HTTP_PORT, sport, &payload, &self.opts)
            .await?;
        if verbose {
            tracing::info!("Sent :{sport} -> {ip}:{HTTP_PORT} {name} {seq_ack}");
        }
        Ok(())
    }

    /// Attribute a captured response to its probed domain via the key table.
    pub fn handle_packet(&self, frame: &[u8]) {
        super::log_tcp_result("HTTP", &self.dkt, frame);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_template() {
        let payload = HttpProber::build_payload("example.com");
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("User-Agent: Mozilla/5.0"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.ends_with("\r\n\r\n"), "request must be fully terminated");
    }

    #[test]
    fn test_payload_embeds_exact_host() {
        let payload = HttpProber::build_payload("пример.рф");
        let text = String::from_utf8(payload).unwrap();
        assert!(
            text.contains("Host: пример.рф\r\n"),
            "domain bytes pass through unmodified"
        );
    }
}
