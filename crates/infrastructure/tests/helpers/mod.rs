#![allow(dead_code)]

pub mod dns_server_mock;
pub mod memory_store;

pub use dns_server_mock::{Behavior, MockDnsServer};
pub use memory_store::MemoryStore;

use fdyn_domain::{ForwardConfig, UpstreamPolicy};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Forward config tuned for tests: sequential order, no periodic probes,
/// short timeouts.
pub fn forward_config(upstreams: &[String]) -> ForwardConfig {
    ForwardConfig {
        to: upstreams.to_vec(),
        policy: UpstreamPolicy::Sequential,
        health_check_interval_ms: 0,
        health_check_timeout_ms: 200,
        timeout_ms: 2000,
        attempt_timeout_ms: 300,
        ..Default::default()
    }
}

pub fn plain(addr: SocketAddr) -> String {
    addr.to_string()
}

pub fn tcp(addr: SocketAddr) -> String {
    format!("tcp://{}", addr)
}

pub fn query(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(fastrand::u16(..))
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message
}

pub fn first_a(reply: &Message) -> Option<Ipv4Addr> {
    reply.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}
