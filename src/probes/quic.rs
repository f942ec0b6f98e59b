//! QUIC v1 Initial probe (RFC 9000/9001).
//!
//! One Initial packet per probe, padded to 1200 bytes: a CRYPTO frame
//! carrying a TLS 1.3 ClientHello, sealed with the initial AEAD keys and
//! header-protected. The destination connection ID is the CRC64 probe
//! fingerprint; servers echo it, so responses are attributable without
//! flow state.

use std::net::IpAddr;
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit as EcbKeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use super::tls::client_hello_msg_13;
use super::{be16, unhex, ProbeError};
use crate::send::packet::fingerprint_cid;
use crate::send::udp::UdpSender;
use crate::track::KeyTable;
use crate::{fill_random, SharedRng};

const QUIC_PORT: u16 = 443;

/// Every Initial datagram is padded to this size.
const INITIAL_SIZE: usize = 1200;

/// QUIC v1 initial salt (RFC 9001 §5.2).
const QUIC_V1_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// x25519 key-share public value carried by the CRYPTO-frame ClientHello.
/// Fixed: the handshake is never completed, so a per-probe keypair would
/// only spend entropy.
const KEY_SHARE: &str = "358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254";

// ─────────────────────────────────────────────────────────────────────────────
// Initial key schedule
// ─────────────────────────────────────────────────────────────────────────────

/// Client-side initial secrets for one DCID.
pub struct KeyMaterial {
    pub secret: [u8; 32],
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hpk: [u8; 16],
}

/// HKDF-Expand-Label (RFC 8446 §7.1) with the `tls13 ` prefix.
fn expand_label(secret: &[u8], label: &str, context: &[u8], out: &mut [u8]) {
    let mut info = Vec::with_capacity(10 + label.len() + context.len());
    info.extend_from_slice(&be16(out.len() as u16));
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    Hkdf::<Sha256>::from_prk(secret)
        .expect("secret is one hash long")
        .expand(&info, out)
        .expect("label output within HKDF bounds");
}

/// Derive the client initial key material from the DCID.
pub fn initial_key_material(dcid: &[u8]) -> KeyMaterial {
    let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(&QUIC_V1_SALT), dcid);

    let mut km = KeyMaterial {
        secret: [0; 32],
        key: [0; 16],
        iv: [0; 12],
        hpk: [0; 16],
    };
    expand_label(initial_secret.as_slice(), "client in", &[], &mut km.secret);
    expand_label(&km.secret, "quic key", &[], &mut km.key);
    expand_label(&km.secret, "quic iv", &[], &mut km.iv);
    expand_label(&km.secret, "quic hp", &[], &mut km.hpk);
    km
}

/// Seal the frame data: AES-128-GCM, nonce = IV xor packet number, AAD =
/// header through the packet-number byte. Returns ciphertext with the
/// 16-byte tag appended.
pub fn encrypt_initial(
    km: &KeyMaterial,
    frame_data: &[u8],
    header: &[u8],
    packet_number: u64,
) -> Result<Vec<u8>, ProbeError> {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&packet_number.to_be_bytes());
    for (n, iv) in nonce.iter_mut().zip(km.iv.iter()) {
        *n ^= iv;
    }

    let cipher = Aes128Gcm::new_from_slice(&km.key)
        .map_err(|e| ProbeError::BuildPayload("quic", e.to_string()))?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: frame_data,
                aad: header,
            },
        )
        .map_err(|e| ProbeError::BuildPayload("quic", e.to_string()))
}

/// Apply header protection in place: AES-ECB over the sample yields the
/// mask; the low nibble of the first byte and the trailing packet-number
/// byte are XORed (RFC 9001 §5.4).
pub fn protect_header(km: &KeyMaterial, header: &mut [u8], sample: &[u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(&km.hpk));
    let mut mask = GenericArray::clone_from_slice(sample);
    cipher.encrypt_block(&mut mask);

    header[0] ^= mask[0] & 0x0f;
    let last = header.len() - 1;
    header[last] ^= mask[1];
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet assembly
// ─────────────────────────────────────────────────────────────────────────────

/// CRYPTO frame at offset 0 carrying the ClientHello for `name`.
fn build_crypto_frame(name: &str, random: &[u8; 32], session_id: &[u8; 32]) -> Vec<u8> {
    let key_share: [u8; 32] = unhex(KEY_SHARE).try_into().expect("32-byte constant");
    let msg = client_hello_msg_13(name, random, session_id, &key_share);

    let mut out = Vec::with_capacity(msg.len() + 4);
    out.push(0x06); // CRYPTO
    out.push(0x00); // offset 0
    // Two-byte varint length (0b01 prefix).
    out.extend_from_slice(&be16(0x4000 | msg.len() as u16));
    out.extend_from_slice(&msg);
    out
}

/// Build the complete Initial datagram.
///
/// Deterministic given the randomness inputs; the public prober wrapper
/// draws them from the process PRNG. Returns the packet and the DCID (the
/// probe fingerprint) for logging.
fn build_initial(
    name: &str,
    dst: IpAddr,
    sport: u16,
    scid: &[u8; 5],
    random: &[u8; 32],
    session_id: &[u8; 32],
) -> Result<(Vec<u8>, [u8; 8]), ProbeError> {
    let dcid = fingerprint_cid(sport, dst);

    // Payload length: packet number (1) + CRYPTO frame + AEAD tag (16).
    let payload_len = 0xfa + name.len() as u16;

    let mut header = Vec::with_capacity(23);
    header.push(0xc0); // long header, Initial, 1-byte packet number
    header.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // version 1
    header.push(dcid.len() as u8);
    header.extend_from_slice(&dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(scid);
    header.push(0x00); // token length
    header.extend_from_slice(&be16(0x4000 | payload_len));
    header.push(0x00); // packet number 0

    let frame = build_crypto_frame(name, random, session_id);
    let km = initial_key_material(&dcid);
    let ciphertext = encrypt_initial(&km, &frame, &header, 0)?;

    let sample: [u8; 16] = ciphertext[3..19]
        .try_into()
        .map_err(|_| ProbeError::BuildPayload("quic", "short ciphertext".into()))?;
    protect_header(&km, &mut header, &sample);

    let mut out = header;
    out.extend_from_slice(&ciphertext);
    if out.len() > INITIAL_SIZE {
        return Err(ProbeError::BuildPayload(
            "quic",
            format!("initial exceeds {INITIAL_SIZE} bytes: {}", out.len()),
        ));
    }
    out.resize(INITIAL_SIZE, 0);
    Ok((out, dcid))
}

/// QUIC prober.
pub struct QuicProber {
    sender: Arc<UdpSender>,
    dkt: Arc<KeyTable<u16>>,
    rng: SharedRng,
}

impl QuicProber {
    pub fn new(sender: Arc<UdpSender>, dkt: Arc<KeyTable<u16>>, rng: SharedRng) -> Self {
        Self { sender, dkt, rng }
    }

    pub async fn send_probe(
        &self,
        ip: IpAddr,
        name: &str,
        verbose: bool,
    ) -> Result<(), ProbeError> {
        // The DCID fingerprint needs the preselected source port.
        let sport = self
            .dkt
            .get(name)
            .ok_or_else(|| ProbeError::UnknownDomain(name.to_string()))?;

        let (mut scid, mut random, mut session_id) = ([0u8; 5], [0u8; 32], [0u8; 32]);
        fill_random(&self.rng, &mut scid);
        fill_random(&self.rng, &mut random);
        fill_random(&self.rng, &mut session_id);

        let (payload, dcid) = build_initial(name, ip, sport, &scid, &random, &session_id)?;
        let sport = self.sender.send(ip, QUIC_PORT, sport, &payload).await?;
        if verbose {
            tracing::info!(
                "Sent :{sport} -> {ip}:{QUIC_PORT} {name} {}",
                hex::encode(dcid)
            );
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
