//! Hand-rolled TLS ClientHello probes.
//!
//! Two builders produce bit-exact record-layer bytes for a TLS 1.2 and a
//! TLS 1.3 ClientHello. All length fields are derived from the SNI name;
//! only the client random, the session ID and (for 1.3) the key-share
//! public value vary between probes. Censorship middleboxes key on the SNI,
//! so nothing past the hello is ever sent.

use std::net::IpAddr;
use std::sync::Arc;

use super::{be16, be24, sni_extension, unhex, ProbeError};
use crate::send::tcp::{TcpOptions, TcpSender};
use crate::track::KeyTable;
use crate::{fill_random, SharedRng};

const TLS_PORT: u16 = 443;

/// Cipher suites and compression methods offered by the 1.2 hello.
const SUITES_12: &str = "001cc02bc02fcca9cca8c02cc030c00ac009c013c014009c009d002f00350100";

/// Cipher suites and compression methods offered by the 1.3 hello.
const SUITES_13: &str = "000813021303130100ff0100";

/// Fixed extension block shared by both hellos: ec_point_formats,
/// supported_groups, session_ticket, encrypt_then_mac, extended_master_secret
/// and signature_algorithms.
const STATIC_EXTENSIONS: &str = "000b000403000102000a00160014001d0017001e0019001801000101010201030104002300000016000000170000000d001e001c040305030603080708080809080a080b080408050806040105010601";

/// psk_key_exchange_modes (psk_dhe_ke), closing the 1.2 extension block.
const PSK_MODES: &str = "002d00020101";

/// supported_versions offering TLS 1.3 only.
const SUPPORTED_VERSIONS_13: &str = "002b0003020304";

/// key_share extension header for one x25519 entry.
const KEY_SHARE_HDR: &str = "003300260024001d0020";

/// Build a TLS 1.2 ClientHello record.
pub fn build_tls12(name: &str, random: &[u8; 32], session_id: &[u8; 32]) -> Vec<u8> {
    let n = name.len() as u16;
    let mut out = Vec::with_capacity(usize::from(n) + 0xcd);

    out.extend_from_slice(&[0x16, 0x03, 0x01]); // handshake record, TLS 1.0
    out.extend_from_slice(&be16(n + 0xc8));
    out.push(0x01); // client_hello
    out.extend_from_slice(&be24(u32::from(n) + 0xc4));
    out.extend_from_slice(&[0x03, 0x03]); // legacy_version TLS 1.2
    out.extend_from_slice(random);
    out.push(0x20);
    out.extend_from_slice(session_id);
    out.extend_from_slice(&unhex(SUITES_12));
    out.extend_from_slice(&be16(n + 0x5f));
    out.extend_from_slice(&sni_extension(name));
    out.extend_from_slice(&unhex(STATIC_EXTENSIONS));
    out.extend_from_slice(&unhex(PSK_MODES));
    out
}

/// Build the TLS 1.3 ClientHello handshake message (no record header).
///
/// Shared with the QUIC prober, whose CRYPTO frame carries this message
/// with a fixed key share.
pub fn client_hello_msg_13(
    name: &str,
    random: &[u8; 32],
    session_id: &[u8; 32],
    key_share: &[u8; 32],
) -> Vec<u8> {
    let n = name.len() as u16;
    let mut out = Vec::with_capacity(usize::from(n) + 0xe5);

    out.push(0x01);
    out.extend_from_slice(&be24(u32::from(n) + 0xe1));
    out.extend_from_slice(&[0x03, 0x03]);
    out.extend_from_slice(random);
    out.push(0x20);
    out.extend_from_slice(session_id);
    out.extend_from_slice(&unhex(SUITES_13));
    out.extend_from_slice(&be16(n + 0x90));
    out.extend_from_slice(&sni_extension(name));
    out.extend_from_slice(&unhex(STATIC_EXTENSIONS));
    out.extend_from_slice(&unhex(SUPPORTED_VERSIONS_13));
    out.extend_from_slice(&unhex(PSK_MODES));
    out.extend_from_slice(&unhex(KEY_SHARE_HDR));
    out.extend_from_slice(key_share);
    out
}

/// Build a TLS 1.3 ClientHello record.
pub fn build_tls13(
    name: &str,
    random: &[u8; 32],
    session_id: &[u8; 32],
    key_share: &[u8; 32],
) -> Vec<u8> {
    let msg = client_hello_msg_13(name, random, session_id, key_share);
    let mut out = Vec::with_capacity(msg.len() + 5);
    out.extend_from_slice(&[0x16, 0x03, 0x01]);
    out.extend_from_slice(&be16(msg.len() as u16));
    out.extend_from_slice(&msg);
    out
}

/// TLS prober: hello payload via the TCP framer to port 443.
pub struct TlsProber {
    sender: Arc<TcpSender>,
    dkt: Arc<KeyTable<u16>>,
    opts: TcpOptions,
    rng: SharedRng,
    /// Offer TLS 1.3 (supported_versions + key_share) instead of 1.2.
    pub tls13: bool,
}

impl TlsProber {
    pub fn new(
        sender: Arc<TcpSender>,
        dkt: Arc<KeyTable<u16>>,
        opts: TcpOptions,
        rng: SharedRng,
    ) -> Self {
        Self { sender, dkt, opts, rng, tls13: false }
    }

    fn build_payload(&self, name: &str) -> Vec<u8> {
        let mut random = [0u8; 32];
        let mut session_id = [0u8; 32];
        fill_random(&self.rng, &mut random);
        fill_random(&self.rng, &mut session_id);
        if self.tls13 {
            let mut key_share = [0u8; 32];
            fill_random(&self.rng, &mut key_share);
            build_tls13(name, &random, &session_id, &key_share)
        } else {
            build_tls12(name, &random, &session_id)
        }
    }

    pub async fn send_probe(
        &self,
        ip: IpAddr,
        name: &str,
        verbose: bool,
    ) -> Result<(), ProbeError> {
        let payload = self.build_payload(name);
        let sport = self.dkt.get(name).unwrap_or(0);
        let (seq_ack, sport) = self
            .sender
            .send(ip, TLS_PORT, sport, &payload, &self.opts)
            .await?;
        if verbose {
            tracing::info!("Sent :{sport} -> {ip}:{TLS_PORT} {name} {seq_ack}");
        }
        Ok(())
    }

    /// Attribute a captured response to its probed domain via the key table.
    pub fn handle_packet(&self, frame: &[u8]) {
        super::log_tcp_result("TLS", &self.dkt, frame);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "example.ulfheim.net";

    fn fixture_random() -> [u8; 32] {
        unhex("c00e5d67c2755389aded7d8b151cbd5bcdf7ed275ad5e028b664880fc7581c77")
            .try_into()
            .unwrap()
    }

    fn fixture_session_id() -> [u8; 32] {
        unhex("547deaf77620043495b358675999c4b7338ff339566349ed0ef6384876655d1b")
            .try_into()
            .unwrap()
    }

    fn fixture_key_share() -> [u8; 32] {
        unhex("358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254")
            .try_into()
            .unwrap()
    }

    #[test]
    fn test_tls13_golden_client_hello() {
        let got = build_tls13(NAME, &fixture_random(), &fixture_session_id(), &fixture_key_share());
        let expected = "16030100f8010000f40303c00e5d67c2755389aded7d8b151cbd5bcdf7ed275ad5e028b664880fc7581c7720547deaf77620043495b358675999c4b7338ff339566349ed0ef6384876655d1b000813021303130100ff010000a30000001800160000136578616d706c652e756c666865696d2e6e6574000b000403000102000a00160014001d0017001e0019001801000101010201030104002300000016000000170000000d001e001c040305030603080708080809080a080b080408050806040105010601002b0003020304002d00020101003300260024001d0020358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254";
        assert_eq!(hex::encode(got), expected, "record bytes must match the fixture");
    }

    #[test]
    fn test_tls12_record_and_handshake_lengths() {
        let hello = build_tls12(NAME, &fixture_random(), &fixture_session_id());
        assert_eq!(&hello[..3], &[0x16, 0x03, 0x01]);
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5, "record length covers the handshake");
        assert_eq!(record_len, NAME.len() + 0xc8);
        assert_eq!(hello[5], 0x01, "handshake type client_hello");
        let hs_len = u32::from_be_bytes([0, hello[6], hello[7], hello[8]]) as usize;
        assert_eq!(hs_len, NAME.len() + 0xc4);
    }

    #[test]
    fn test_tls12_carries_sni() {
        let hello = build_tls12(NAME, &fixture_random(), &fixture_session_id());
        let needle = NAME.as_bytes();
        assert!(
            hello.windows(needle.len()).any(|w| w == needle),
            "hostname must appear in the hello"
        );
    }

    #[test]
    fn test_tls12_suite_list() {
        let hello = build_tls12(NAME, &fixture_random(), &fixture_session_id());
        // Suites start after record(5) + hs(4) + ver(2) + random(32) + sid(33).
        let suites = &hello[76..106];
        assert_eq!(&suites[..2], &[0x00, 0x1c], "14 suites = 28 bytes");
        assert_eq!(&suites[2..4], &[0xc0, 0x2b], "ECDHE-ECDSA-AES128-GCM leads");
        assert_eq!(&suites[28..30], &[0x00, 0x35], "RSA-AES256-CBC closes");
    }

    #[test]
    fn test_tls13_random_fields_change_only() {
        let a = build_tls13(NAME, &[1u8; 32], &[2u8; 32], &fixture_key_share());
        let b = build_tls13(NAME, &[9u8; 32], &[8u8; 32], &fixture_key_share());
        assert_eq!(a.len(), b.len());
        let diff: Vec<usize> = (0..a.len()).filter(|&i| a[i] != b[i]).collect();
        // Random spans 11..43, session ID 44..76.
        assert!(diff.iter().all(|&i| (11..43).contains(&i) || (44..76).contains(&i)),
            "only random and session-id bytes may differ");
    }

    #[test]
    fn test_tls13_length_fields_track_name_length() {
        for name in ["a.cn", "subdomain.example.org"] {
            let hello = build_tls13(name, &[0u8; 32], &[0u8; 32], &[0u8; 32]);
            let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
            assert_eq!(record_len, name.len() + 0xe5);
            assert_eq!(hello.len(), record_len + 5);
        }
    }
}
