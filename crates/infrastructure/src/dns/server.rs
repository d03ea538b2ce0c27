use crate::dns::forwarding::{error_reply, Forwarder};
use crate::dns::transport::TransportKind;
use fdyn_domain::ForwardZone;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use std::sync::Arc;
use tracing::{debug, warn};

const DNS_HEADER_LEN: usize = 12;
const MIN_UDP_PAYLOAD: u16 = 512;

/// Turns one inbound wire message into the wire reply, if any.
pub struct DnsServerHandler {
    forwarder: Arc<Forwarder>,
    zone: ForwardZone,
}

impl DnsServerHandler {
    pub fn new(forwarder: Arc<Forwarder>, zone: ForwardZone) -> Self {
        Self { forwarder, zone }
    }

    /// `None` means nothing should be written back.
    pub async fn handle(&self, bytes: &[u8], client: TransportKind) -> Option<Vec<u8>> {
        let request = match Message::from_vec(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "Malformed query");
                return malformed_reply(bytes);
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        let reply = self.reply_for(&request, client).await;
        let max_size = match client {
            TransportKind::Udp => max_udp_payload(&request),
            TransportKind::Tcp | TransportKind::Tls => u16::MAX as usize,
        };
        encode(reply, max_size)
    }

    async fn reply_for(&self, request: &Message, client: TransportKind) -> Message {
        let [query] = request.queries() else {
            return error_reply(request, ResponseCode::FormErr);
        };

        let qname = query.name().to_ascii();
        if !self.zone.matches(&qname) {
            debug!(qname = %qname, zone = %self.zone.from(), "Query outside forward zone");
            return error_reply(request, ResponseCode::Refused);
        }

        match self.forwarder.forward(request, client).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(qname = %qname, qtype = %query.query_type(), error = %e, "Forwarding failed");
                error_reply(request, ResponseCode::ServFail)
            }
        }
    }
}

fn malformed_reply(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() < DNS_HEADER_LEN {
        return None;
    }
    let mut reply = Message::new();
    reply
        .set_id(u16::from_be_bytes([bytes[0], bytes[1]]))
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::FormErr);
    reply.to_vec().ok()
}

fn max_udp_payload(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(MIN_UDP_PAYLOAD)
        .max(MIN_UDP_PAYLOAD) as usize
}

/// Encodes `reply`, dropping every record section and setting TC when it
/// does not fit in `max_size`.
fn encode(mut reply: Message, max_size: usize) -> Option<Vec<u8>> {
    let bytes = match reply.to_vec() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            return None;
        }
    };
    if bytes.len() <= max_size {
        return Some(bytes);
    }

    debug!(size = bytes.len(), max_size, "Reply truncated");
    reply.take_answers();
    reply.take_name_servers();
    reply.take_additionals();
    reply.set_truncated(true);
    reply.to_vec().ok()
}
