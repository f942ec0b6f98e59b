//! DNS query probe.
//!
//! One recursion-desired question per probe, sent to the target's port 53
//! from a random high source port. Responses are attributed by the query
//! name itself, so the live callback can print results without consulting
//! the key table.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use rand::Rng;

use super::{parse_frame, ProbeError, Transport};
use crate::send::udp::UdpSender;
use crate::SharedRng;

const DNS_PORT: u16 = 53;

/// DNS prober.
pub struct DnsProber {
    sender: Arc<UdpSender>,
    qtype: u16,
    rng: SharedRng,
}

impl DnsProber {
    /// `qtype` is the numeric query type (1 = A, 28 = AAAA).
    pub fn new(sender: Arc<UdpSender>, qtype: u16, rng: SharedRng) -> Self {
        Self { sender, qtype, rng }
    }

    /// Build the query message bytes for `name`.
    pub fn build_payload(&self, name: &str) -> Result<Vec<u8>, ProbeError> {
        let id: u16 = self.rng.lock().expect("rng poisoned").gen();
        build_query(name, self.qtype, id)
    }

    pub async fn send_probe(
        &self,
        ip: IpAddr,
        name: &str,
        verbose: bool,
    ) -> Result<(), ProbeError> {
        let payload = self.build_payload(name)?;
        // Ephemeral-range source port; DNS attribution rides on the QNAME.
        let sport = self.rng.lock().expect("rng poisoned").gen_range(2000..=65535);

        let sport = self.sender.send(ip, DNS_PORT, sport, &payload).await?;
        if verbose {
            tracing::info!(
                "Sent :{sport} -> {ip}:{DNS_PORT} {name} {}",
                hex::encode(&payload)
            );
        }
        Ok(())
    }

    /// Print one result line per captured DNS response.
    pub fn handle_packet(&self, frame: &[u8]) {
        let Some(parsed) = parse_frame(frame) else { return };
        let Transport::Udp { payload, .. } = parsed.transport else {
            // ICMP errors match the capture filter but carry no DNS layer.
            return;
        };
        let Ok(msg) = Message::from_vec(payload) else { return };
        let Some(query) = msg.queries().first() else { return };

        tracing::info!(
            "RESULT {} {}, {} {} answers",
            parsed.src,
            query.name(),
            msg.response_code(),
            msg.answers().len()
        );
    }
}

/// Build a single-question query: `(fqdn(name), qtype, IN)`, RD set.
fn build_query(name: &str, qtype: u16, id: u16) -> Result<Vec<u8>, ProbeError> {
    let fqdn = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    };
    let qname =
        Name::from_utf8(&fqdn).map_err(|e| ProbeError::BuildPayload("dns", e.to_string()))?;

    let mut query = Query::query(qname, RecordType::from(qtype));
    query.set_query_class(DNSClass::IN);

    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(query);

    msg.to_vec()
        .map_err(|e| ProbeError::BuildPayload("dns", e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_is_29_bytes_for_example_com() {
        let payload = build_query("example.com", 1, 0x1234).unwrap();
        assert_eq!(
            payload.len(),
            29,
            "header(12) + qname(13) + qtype(2) + qclass(2)"
        );
    }

    #[test]
    fn test_query_header_fields() {
        let payload = build_query("example.com", 1, 0xabcd).unwrap();
        assert_eq!(&payload[..2], &[0xab, 0xcd], "transaction ID");
        assert_eq!(payload[2] & 0x80, 0, "QR must be query");
        assert_eq!(payload[2] & 0x01, 0x01, "RD must be set");
        assert_eq!(&payload[4..6], &[0x00, 0x01], "QDCOUNT = 1");
        assert_eq!(&payload[6..12], &[0u8; 6], "no answer/authority/additional");
    }

    #[test]
    fn test_query_question_encoding() {
        let payload = build_query("example.com", 1, 1).unwrap();
        // QNAME: 7"example" 3"com" 0, then type A, class IN.
        let mut expected = vec![7u8];
        expected.extend_from_slice(b"example");
        expected.push(3);
        expected.extend_from_slice(b"com");
        expected.push(0);
        expected.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&payload[12..], &expected[..]);
    }

    #[test]
    fn test_query_qtype_aaaa() {
        let payload = build_query("example.com", 28, 1).unwrap();
        let qtype = u16::from_be_bytes([payload[25], payload[26]]);
        assert_eq!(qtype, 28, "AAAA qtype must be encoded");
    }

    #[test]
    fn test_round_trip_through_hickory() {
        let payload = build_query("test.example.org", 1, 77).unwrap();
        let msg = Message::from_vec(&payload).unwrap();
        assert_eq!(msg.id(), 77);
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].name().to_utf8(), "test.example.org.");
    }
}
