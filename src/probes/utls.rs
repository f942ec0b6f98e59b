//! Browser-fingerprinted TLS ClientHello probe.
//!
//! Reproduces a Chrome-like hello: GREASE values in the cipher list and
//! extension list, Chrome's extension ordering (including
//! extended-master-secret, status_request, SCT, compress_certificate and
//! the 0x4469 application-settings extension), and boring-style padding.
//!
//! The expensive parts are done once per process: the x25519 key share and
//! the GREASE draw are cached in a template, and only the client random and
//! session ID are refreshed per probe.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{be16, be24, sni_ext_data, ProbeError};
use crate::send::tcp::{TcpOptions, TcpSender};
use crate::track::KeyTable;
use crate::{fill_random, SharedRng};

const TLS_PORT: u16 = 443;

/// GREASE values are of the form `0x?a?a` (RFC 8701).
fn grease_value(index: u8) -> u16 {
    let n = (index & 0x0f) as u16;
    (n << 12) | 0x0a00 | (n << 4) | 0x000a
}

/// GREASE draw for one template: cipher list, two extension slots, the
/// supported-groups/key-share slot and the supported-versions slot.
struct GreaseSet {
    cipher: u16,
    ext1: u16,
    ext2: u16,
    group: u16,
    version: u16,
}

impl GreaseSet {
    fn draw(rng: &SharedRng) -> Self {
        let mut rng = rng.lock().expect("rng poisoned");
        let cipher = grease_value(rng.gen());
        let ext1 = grease_value(rng.gen());
        // Chrome never repeats the extension GREASE value.
        let mut ext2 = grease_value(rng.gen());
        if ext2 == ext1 {
            ext2 = grease_value((ext1 >> 12) as u8 + 1);
        }
        GreaseSet {
            cipher,
            ext1,
            ext2,
            group: grease_value(rng.gen()),
            version: grease_value(rng.gen()),
        }
    }
}

/// Cached per-process hello template.
pub struct UtlsTemplate {
    grease: GreaseSet,
    key_share: [u8; 32],
}

impl UtlsTemplate {
    /// Draw GREASE values and generate the x25519 key share (the one
    /// elliptic-curve operation; everything after is byte shuffling).
    pub fn new(rng: &SharedRng) -> Self {
        let secret = {
            let mut guard = rng.lock().expect("rng poisoned");
            StaticSecret::random_from_rng(&mut *guard)
        };
        let public = PublicKey::from(&secret);
        Self {
            grease: GreaseSet::draw(rng),
            key_share: *public.as_bytes(),
        }
    }

    /// Assemble the record for `name` with fresh random and session ID.
    pub fn build(&self, name: &str, random: &[u8; 32], session_id: &[u8; 32]) -> Vec<u8> {
        let g = &self.grease;

        let mut exts: Vec<(u16, Vec<u8>)> = Vec::with_capacity(18);
        exts.push((g.ext1, Vec::new()));
        exts.push((0x0000, sni_ext_data(name)));
        exts.push((0x0017, Vec::new())); // extended_master_secret
        exts.push((0xff01, vec![0x00])); // renegotiation_info
        {
            // supported_groups: GREASE, x25519, secp256r1, secp384r1
            let mut d = Vec::with_capacity(10);
            d.extend_from_slice(&be16(8));
            for group in [g.group, 0x001d, 0x0017, 0x0018] {
                d.extend_from_slice(&be16(group));
            }
            exts.push((0x000a, d));
        }
        exts.push((0x000b, vec![0x01, 0x00])); // ec_point_formats: uncompressed
        exts.push((0x0023, Vec::new())); // session_ticket
        {
            // ALPN: h2, http/1.1
            let mut d = Vec::with_capacity(14);
            d.extend_from_slice(&be16(12));
            d.push(2);
            d.extend_from_slice(b"h2");
            d.push(8);
            d.extend_from_slice(b"http/1.1");
            exts.push((0x0010, d));
        }
        exts.push((0x0005, vec![0x01, 0x00, 0x00, 0x00, 0x00])); // status_request: ocsp
        {
            // signature_algorithms, Chrome order
            let mut d = Vec::with_capacity(18);
            d.extend_from_slice(&be16(16));
            for alg in [0x0403u16, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601] {
                d.extend_from_slice(&be16(alg));
            }
            exts.push((0x000d, d));
        }
        exts.push((0x0012, Vec::new())); // signed_certificate_timestamp
        {
            // key_share: GREASE entry (one zero byte) + x25519
            let mut d = Vec::with_capacity(43);
            d.extend_from_slice(&be16(41));
            d.extend_from_slice(&be16(g.group));
            d.extend_from_slice(&be16(1));
            d.push(0x00);
            d.extend_from_slice(&be16(0x001d));
            d.extend_from_slice(&be16(32));
            d.extend_from_slice(&self.key_share);
            exts.push((0x0033, d));
        }
        exts.push((0x002d, vec![0x01, 0x01])); // psk_key_exchange_modes: dhe
        {
            // supported_versions: GREASE, 1.3, 1.2
            let mut d = Vec::with_capacity(7);
            d.push(6);
            for v in [g.version, 0x0304, 0x0303] {
                d.extend_from_slice(&be16(v));
            }
            exts.push((0x002b, d));
        }
        exts.push((0x001b, vec![0x02, 0x00, 0x02])); // compress_certificate: brotli
        exts.push((0x4469, Vec::new())); // application settings
        exts.push((g.ext2, vec![0x00]));

        let mut body = Vec::with_capacity(512);
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(random);
        body.push(0x20);
        body.extend_from_slice(session_id);
        // Cipher suites: GREASE + Chrome's 15.
        body.extend_from_slice(&be16(32));
        for suite in [
            g.cipher, 0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
            0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ] {
            body.extend_from_slice(&be16(suite));
        }
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut ext_bytes = Vec::with_capacity(256);
        for (id, data) in &exts {
            ext_bytes.extend_from_slice(&be16(*id));
            ext_bytes.extend_from_slice(&be16(data.len() as u16));
            ext_bytes.extend_from_slice(data);
        }

        // Boring-style padding over the would-be handshake message length
        // (4-byte header + body + extensions field).
        let unpadded = 4 + body.len() + 2 + ext_bytes.len();
        if let Some(pad) = boring_padding_len(unpadded) {
            ext_bytes.extend_from_slice(&be16(0x0015));
            ext_bytes.extend_from_slice(&be16(pad as u16));
            ext_bytes.resize(ext_bytes.len() + pad, 0);
        }

        body.extend_from_slice(&be16(ext_bytes.len() as u16));
        body.extend_from_slice(&ext_bytes);

        let mut out = Vec::with_capacity(body.len() + 9);
        out.extend_from_slice(&[0x16, 0x03, 0x01]);
        out.extend_from_slice(&be16(body.len() as u16 + 4));
        out.push(0x01);
        out.extend_from_slice(&be24(body.len() as u32));
        out.extend_from_slice(&body);
        out
    }
}

/// BoringSSL padding rule: hellos between 256 and 511 bytes are padded to
/// 512 (the returned length excludes the extension's own 4-byte header).
fn boring_padding_len(unpadded: usize) -> Option<usize> {
    if !(0x100..0x200).contains(&unpadded) {
        return None;
    }
    let padding = 0x200 - unpadded;
    Some(if padding >= 5 { padding - 4 } else { 1 })
}

/// uTLS prober.
pub struct UtlsProber {
    sender: Arc<TcpSender>,
    dkt: Arc<KeyTable<u16>>,
    opts: TcpOptions,
    rng: SharedRng,
    template: std::sync::OnceLock<UtlsTemplate>,
}

impl UtlsProber {
    pub fn new(
        sender: Arc<TcpSender>,
        dkt: Arc<KeyTable<u16>>,
        opts: TcpOptions,
        rng: SharedRng,
    ) -> Self {
        Self {
            sender,
            dkt,
            opts,
            rng,
            template: std::sync::OnceLock::new(),
        }
    }

    fn build_payload(&self, name: &str) -> Vec<u8> {
        let template = self.template.get_or_init(|| UtlsTemplate::new(&self.rng));
        let mut random = [0u8; 32];
        let mut session_id = [0u8; 32];
        fill_random(&self.rng, &mut random);
        fill_random(&self.rng, &mut session_id);
        template.build(name, &random, &session_id)
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

    const NAME: &str = "example.com";

    fn test_template() -> UtlsTemplate {
        UtlsTemplate::new(&crate::seeded_rng(1234))
    }

    fn is_grease(v: u16) -> bool {
        let hi = (v >> 8) as u8;
        let lo = v as u8;
        hi == lo && lo & 0x0f == 0x0a
    }

    /// Walk the extension block, returning (id, data) pairs.
    fn extensions(hello: &[u8]) -> Vec<(u16, Vec<u8>)> {
        // record(5) + hs(4) + ver(2) + random(32) + sid(1+32) = 76
        let suites_len = u16::from_be_bytes([hello[76], hello[77]]) as usize;
        let mut off = 76 + 2 + suites_len + 2; // + compression
        let ext_len = u16::from_be_bytes([hello[off], hello[off + 1]]) as usize;
        off += 2;
        let end = off + ext_len;
        assert_eq!(end, hello.len(), "extensions must fill the hello");

        let mut out = Vec::new();
        while off < end {
            let id = u16::from_be_bytes([hello[off], hello[off + 1]]);
            let len = u16::from_be_bytes([hello[off + 2], hello[off + 3]]) as usize;
            out.push((id, hello[off + 4..off + 4 + len].to_vec()));
            off += 4 + len;
        }
        out
    }

    #[test]
    fn test_grease_values_are_well_formed() {
        for i in 0..=255u8 {
            assert!(is_grease(grease_value(i)), "{:04x}", grease_value(i));
        }
    }

    #[test]
    fn test_record_and_handshake_framing() {
        let hello = test_template().build(NAME, &[0u8; 32], &[0u8; 32]);
        assert_eq!(&hello[..3], &[0x16, 0x03, 0x01]);
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5);
        assert_eq!(hello[5], 0x01);
    }

    #[test]
    fn test_cipher_suites_grease_then_chrome_order() {
        let hello = test_template().build(NAME, &[0u8; 32], &[0u8; 32]);
        let suites_len = u16::from_be_bytes([hello[76], hello[77]]) as usize;
        assert_eq!(suites_len, 32, "16 suites");
        let first = u16::from_be_bytes([hello[78], hello[79]]);
        assert!(is_grease(first), "suite list must lead with GREASE");
        let second = u16::from_be_bytes([hello[80], hello[81]]);
        assert_eq!(second, 0x1301, "TLS_AES_128_GCM_SHA256 follows GREASE");
        let last = u16::from_be_bytes([hello[76 + 2 + 30], hello[76 + 2 + 31]]);
        assert_eq!(last, 0x0035);
    }

    #[test]
    fn test_extension_order_matches_chrome_profile() {
        let hello = test_template().build(NAME, &[0u8; 32], &[0u8; 32]);
        let exts = extensions(&hello);
        let ids: Vec<u16> = exts.iter().map(|(id, _)| *id).collect();

        assert!(is_grease(ids[0]), "first extension is GREASE");
        let expected_middle = [
            0x0000, 0x0017, 0xff01, 0x000a, 0x000b, 0x0023, 0x0010, 0x0005, 0x000d, 0x0012,
            0x0033, 0x002d, 0x002b, 0x001b, 0x4469,
        ];
        assert_eq!(&ids[1..16], &expected_middle, "fixed extension ordering");
        assert!(is_grease(ids[16]), "trailing GREASE extension");
        assert_ne!(ids[0], ids[16], "the two GREASE extensions must differ");
        assert_eq!(ids[17], 0x0015, "padding closes the hello");
    }

    #[test]
    fn test_key_share_carries_cached_x25519_entry() {
        let template = test_template();
        let a = template.build(NAME, &[1u8; 32], &[1u8; 32]);
        let b = template.build(NAME, &[2u8; 32], &[2u8; 32]);

        let share = |hello: &[u8]| {
            extensions(hello)
                .into_iter()
                .find(|(id, _)| *id == 0x0033)
                .map(|(_, data)| data)
                .expect("key_share present")
        };
        let sa = share(&a);
        assert_eq!(sa, share(&b), "key share is cached across probes");
        // entries: GREASE(2+2+1) then x25519 group + length + 32 bytes.
        assert_eq!(&sa[7..9], &[0x00, 0x1d]);
        assert_eq!(u16::from_be_bytes([sa[9], sa[10]]), 32);
        assert_eq!(&sa[11..43], &template.key_share);
    }

    #[test]
    fn test_padding_reaches_512_byte_message() {
        let hello = test_template().build(NAME, &[0u8; 32], &[0u8; 32]);
        // Handshake message = everything after the 5-byte record header.
        let msg_len = hello.len() - 5;
        assert_eq!(msg_len, 512, "boring padding pads mid-size hellos to 512");
    }

    #[test]
    fn test_supported_versions_offers_grease_13_12() {
        let hello = test_template().build(NAME, &[0u8; 32], &[0u8; 32]);
        let (_, data) = extensions(&hello)
            .into_iter()
            .find(|(id, _)| *id == 0x002b)
            .expect("supported_versions present");
        assert_eq!(data[0], 6);
        assert!(is_grease(u16::from_be_bytes([data[1], data[2]])));
        assert_eq!(&data[3..7], &[0x03, 0x04, 0x03, 0x03]);
    }

    #[test]
    fn test_sni_matches_name() {
        let hello = test_template().build("sub.domain.example", &[0u8; 32], &[0u8; 32]);
        let (_, data) = extensions(&hello)
            .into_iter()
            .find(|(id, _)| *id == 0x0000)
            .expect("SNI present");
        assert_eq!(&data[5..], b"sub.domain.example");
    }

    #[test]
    fn test_boring_padding_rule() {
        assert_eq!(boring_padding_len(100), None, "short hellos are not padded");
        assert_eq!(boring_padding_len(0x200), None, "large hellos are not padded");
        assert_eq!(boring_padding_len(0x100), Some(0x100 - 4));
        assert_eq!(boring_padding_len(0x1fe), Some(1), "tiny gap still pads one byte");
    }

    #[test]
    fn test_deterministic_under_seed() {
        let a = UtlsTemplate::new(&crate::seeded_rng(99)).build(NAME, &[3u8; 32], &[4u8; 32]);
        let b = UtlsTemplate::new(&crate::seeded_rng(99)).build(NAME, &[3u8; 32], &[4u8; 32]);
        assert_eq!(a, b, "seeded template must reproduce byte-identical hellos");
    }
}
