//! DTLS ClientHello probes.
//!
//! Single-record, single-fragment ClientHellos for DTLS 1.2 and DTLS 1.3
//! (epoch 0, sequence 0, empty session ID and cookie). The SNI extension
//! can be suppressed, and the destination port optionally randomized over a
//! configured range to probe port-insensitive filtering.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use super::{be16, be24, sni_extension, unhex, ProbeError};
use crate::send::udp::UdpSender;
use crate::track::KeyTable;
use crate::{fill_random, SharedRng};

const DTLS_PORT: u16 = 443;

/// DTLS 1.2 cipher suites and compression methods.
const SUITES_12: &str = "0016c02bc02fcca9cca8c009c013c00ac014009c002f00350100";

/// DTLS 1.2 fixed extension block: extended_master_secret,
/// renegotiation_info, supported_groups, ec_point_formats, session_ticket,
/// signature_algorithms and use_srtp.
const STATIC_EXTENSIONS_12: &str = "00170000ff01000100000a00080006001d00170018000b0002010000230000000d00140012040308040401050308050501080606010201000e0009000600010008000700";

/// DTLS 1.3 cipher suites and compression methods.
const SUITES_13: &str = "00061301130213030100";

/// DTLS 1.3 fixed extension block after the key share: supported_versions
/// (DTLS 1.3), signature_algorithms, encrypt_then_mac and supported_groups.
const STATIC_EXTENSIONS_13: &str = "002b000302fefc000d0020001e06030503040302030806080b0805080a080408090601050104010301020100160000000a00040002001d";

const KEY_SHARE_HDR: &str = "003300260024001d0020";

/// Assemble record header + handshake-fragment header + hello body.
///
/// `record_version` is the legacy record-layer version (`feff` for 1.2,
/// `fefd` for 1.3); the body always carries legacy client version `fefd`.
fn dtls_record(record_version: [u8; 2], body: &[u8]) -> Vec<u8> {
    let body_len = body.len() as u32;
    let mut out = Vec::with_capacity(body.len() + 25);

    out.push(0x16); // handshake
    out.extend_from_slice(&record_version);
    out.extend_from_slice(&[0x00, 0x00]); // epoch 0
    out.extend_from_slice(&[0u8; 6]); // record sequence 0
    out.extend_from_slice(&be16(body_len as u16 + 12));

    out.push(0x01); // client_hello
    out.extend_from_slice(&be24(body_len));
    out.extend_from_slice(&[0x00, 0x00]); // message_seq 0
    out.extend_from_slice(&[0u8; 3]); // fragment_offset 0
    out.extend_from_slice(&be24(body_len)); // one fragment spans the message
    out.extend_from_slice(body);
    out
}

/// Build a DTLS 1.2 ClientHello record.
pub fn build_dtls12(name: &str, send_sni: bool, random: &[u8; 32]) -> Vec<u8> {
    let static_ext = unhex(STATIC_EXTENSIONS_12);
    let sni = if send_sni { sni_extension(name) } else { Vec::new() };
    let ext_len = (static_ext.len() + sni.len()) as u16;

    let mut body = Vec::with_capacity(usize::from(ext_len) + 0x40);
    body.extend_from_slice(&[0xfe, 0xfd]); // legacy client version
    body.extend_from_slice(random);
    body.push(0x00); // empty session ID
    body.push(0x00); // empty cookie
    body.extend_from_slice(&unhex(SUITES_12));
    body.extend_from_slice(&be16(ext_len));
    body.extend_from_slice(&sni);
    body.extend_from_slice(&static_ext);

    dtls_record([0xfe, 0xff], &body)
}

/// Build a DTLS 1.3 ClientHello record (negotiated via supported_versions,
/// with an x25519 key share).
pub fn build_dtls13(name: &str, send_sni: bool, random: &[u8; 32], key_share: &[u8; 32]) -> Vec<u8> {
    let mut tail = unhex(KEY_SHARE_HDR);
    tail.extend_from_slice(key_share);
    tail.extend_from_slice(&unhex(STATIC_EXTENSIONS_13));
    let sni = if send_sni { sni_extension(name) } else { Vec::new() };
    let ext_len = (tail.len() + sni.len()) as u16;

    let mut body = Vec::with_capacity(usize::from(ext_len) + 0x30);
    body.extend_from_slice(&[0xfe, 0xfd]);
    body.extend_from_slice(random);
    body.push(0x00);
    body.push(0x00);
    body.extend_from_slice(&unhex(SUITES_13));
    body.extend_from_slice(&be16(ext_len));
    body.extend_from_slice(&sni);
    body.extend_from_slice(&tail);

    dtls_record([0xfe, 0xfd], &body)
}

/// Parse a `"MIN-MAX"` destination-port range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16), ProbeError> {
    let err = || ProbeError::PortRangeSyntax(s.to_string());
    let (min, max) = s.split_once('-').ok_or_else(err)?;
    let min: u16 = min.trim().parse().map_err(|_| err())?;
    let max: u16 = max.trim().parse().map_err(|_| err())?;
    if min > max {
        return Err(err());
    }
    Ok((min, max))
}

/// DTLS prober.
pub struct DtlsProber {
    sender: Arc<UdpSender>,
    dkt: Arc<KeyTable<u16>>,
    send_sni: bool,
    /// When set, the destination port is drawn uniformly from this range
    /// instead of 443.
    dest_port_range: Option<(u16, u16)>,
    rng: SharedRng,
    /// Offer DTLS 1.3 instead of 1.2.
    pub dtls13: bool,
}

impl DtlsProber {
    pub fn new(
        sender: Arc<UdpSender>,
        dkt: Arc<KeyTable<u16>>,
        send_sni: bool,
        dest_port_range: Option<(u16, u16)>,
        rng: SharedRng,
    ) -> Self {
        Self {
            sender,
            dkt,
            send_sni,
            dest_port_range,
            rng,
            dtls13: false,
        }
    }

    fn build_payload(&self, name: &str) -> Vec<u8> {
        let mut random = [0u8; 32];
        fill_random(&self.rng, &mut random);
        if self.dtls13 {
            let mut key_share = [0u8; 32];
            fill_random(&self.rng, &mut key_share);
            build_dtls13(name, self.send_sni, &random, &key_share)
        } else {
            build_dtls12(name, self.send_sni, &random)
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
        let dport = match self.dest_port_range {
            Some((min, max)) => self.rng.lock().expect("rng poisoned").gen_range(min..=max),
            None => DTLS_PORT,
        };

        let sport = self.sender.send(ip, dport, sport, &payload).await?;
        if verbose {
            tracing::info!(
                "Sent :{sport} -> {ip}:{dport} {name} {}",
                hex::encode(&payload)
            );
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "example.com";

    #[test]
    fn test_dtls12_record_header() {
        let rec = build_dtls12(NAME, true, &[0u8; 32]);
        assert_eq!(&rec[..3], &[0x16, 0xfe, 0xff], "record version DTLS 1.0 legacy");
        assert_eq!(&rec[3..5], &[0, 0], "epoch 0");
        assert_eq!(&rec[5..11], &[0u8; 6], "sequence 0");
        let record_len = u16::from_be_bytes([rec[11], rec[12]]) as usize;
        assert_eq!(record_len, rec.len() - 13, "record length covers the fragment");
        assert_eq!(record_len, NAME.len() + 9 + 0x44 + 0x4c, "length law");
    }

    #[test]
    fn test_dtls12_fragment_spans_whole_message() {
        let rec = build_dtls12(NAME, true, &[0u8; 32]);
        assert_eq!(rec[13], 0x01, "client_hello");
        let msg_len = u32::from_be_bytes([0, rec[14], rec[15], rec[16]]);
        assert_eq!(&rec[17..19], &[0, 0], "message_seq 0");
        assert_eq!(&rec[19..22], &[0, 0, 0], "fragment_offset 0");
        let frag_len = u32::from_be_bytes([0, rec[22], rec[23], rec[24]]);
        assert_eq!(frag_len, msg_len, "single fragment covers the hello");
        assert_eq!(msg_len as usize, NAME.len() + 9 + 0x44 + 0x40);
    }

    #[test]
    fn test_dtls12_body_prefix() {
        let random = [0x5au8; 32];
        let rec = build_dtls12(NAME, true, &random);
        let body = &rec[25..];
        assert_eq!(&body[..2], &[0xfe, 0xfd], "legacy client version DTLS 1.2");
        assert_eq!(&body[2..34], &random);
        assert_eq!(body[34], 0x00, "empty session ID");
        assert_eq!(body[35], 0x00, "empty cookie");
        assert_eq!(&body[36..38], &[0x00, 0x16], "11 suites = 22 bytes");
    }

    #[test]
    fn test_dtls12_sni_suppression() {
        let with = build_dtls12(NAME, true, &[0u8; 32]);
        let without = build_dtls12(NAME, false, &[0u8; 32]);
        assert_eq!(
            with.len() - without.len(),
            NAME.len() + 9,
            "SNI extension adds name + 9 bytes"
        );
        let needle = NAME.as_bytes();
        assert!(!without.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_dtls13_negotiates_via_supported_versions() {
        let rec = build_dtls13(NAME, true, &[0u8; 32], &[7u8; 32]);
        assert_eq!(&rec[..3], &[0x16, 0xfe, 0xfd], "record version DTLS 1.2 legacy");
        // supported_versions extension offering fefc (DTLS 1.3).
        let needle = unhex("002b000302fefc");
        assert!(
            rec.windows(needle.len()).any(|w| w == needle.as_slice()),
            "supported_versions must offer DTLS 1.3"
        );
        // key share carries the supplied public value.
        let ks = [7u8; 32];
        assert!(rec.windows(32).any(|w| w == ks));
    }

    #[test]
    fn test_dtls13_length_law() {
        let rec = build_dtls13(NAME, true, &[0u8; 32], &[0u8; 32]);
        let record_len = u16::from_be_bytes([rec[11], rec[12]]) as usize;
        let ext_len = NAME.len() + 9 + 0x61;
        assert_eq!(record_len, ext_len + 0x3c);
        let msg_len = u32::from_be_bytes([0, rec[14], rec[15], rec[16]]) as usize;
        assert_eq!(msg_len, ext_len + 0x30);
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("1000-65535").unwrap(), (1000, 65535));
        assert_eq!(parse_port_range("443-443").unwrap(), (443, 443));
        assert!(parse_port_range("1000").is_err());
        assert!(parse_port_range("a-b").is_err());
        assert!(parse_port_range("9000-10").is_err(), "inverted range is malformed");
    }
}
