//! Dynamic address rewrite.
//!
//! Answers carrying the unspecified address (`0.0.0.0` or `::`) are
//! placeholders. The real address is looked up by query name, falling back
//! to wildcard keys for each parent suffix:
//!
//! ```text
//! a.b.example.  ->  "a.b.example."  "*.b.example."  "*.example."
//! ```
//!
//! Both A and AAAA placeholders are rewritten. An IPv4 value placed in an
//! AAAA record uses the IPv4-mapped form; an IPv6 value is only accepted
//! for an A record when it is itself IPv4-mapped.

use super::store::AddressStore;
use fdyn_domain::DomainError;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

pub struct Rewriter {
    store: Option<Arc<dyn AddressStore>>,
}

impl Rewriter {
    pub fn new(store: Option<Arc<dyn AddressStore>>) -> Self {
        Self { store }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Replaces every unspecified address answer in `reply`. Returns the
    /// number of records changed.
    pub async fn rewrite(&self, reply: &mut Message, qname: &str) -> Result<usize, DomainError> {
        if !needs_rewrite(reply) {
            return Ok(0);
        }

        let store = self.store.as_ref().ok_or(DomainError::NoAddressStore)?;
        let value = lookup(store.as_ref(), qname)
            .await?
            .ok_or_else(|| DomainError::RewriteFailed(format!("no address stored for {}", qname)))?;
        let addr: IpAddr = value.trim().parse().map_err(|_| {
            DomainError::InvalidIpAddress(format!("'{}' stored for {}", value, qname))
        })?;

        let mut answers = reply.take_answers();
        let mut rewritten = 0;
        let mut result = Ok(());

        for record in answers.iter_mut() {
            let rdata = match placeholder_type(record.data()) {
                Some(RecordType::A) => match as_ipv4(addr) {
                    Some(v4) => RData::A(A(v4)),
                    None => {
                        result = Err(DomainError::InvalidIpAddress(format!(
                            "IPv6 address {} stored for A record of {}",
                            addr, qname
                        )));
                        break;
                    }
                },
                Some(_) => RData::AAAA(AAAA(as_ipv6(addr))),
                None => continue,
            };
            record.set_data(Some(rdata));
            rewritten += 1;
        }

        reply.insert_answers(answers);
        result?;

        debug!(qname = %qname, address = %addr, rewritten, "Rewrote placeholder answers");
        Ok(rewritten)
    }

    pub async fn close(&self) {
        if let Some(store) = &self.store {
            store.close().await;
        }
    }
}

/// Keys tried for `qname`, most specific first.
pub fn lookup_keys(qname: &str) -> Vec<String> {
    let mut keys = vec![qname.to_string()];
    let mut rest = qname;
    while let Some((_, suffix)) = rest.split_once('.') {
        if suffix.is_empty() {
            break;
        }
        keys.push(format!("*.{}", suffix));
        rest = suffix;
    }
    keys
}

async fn lookup(store: &dyn AddressStore, qname: &str) -> Result<Option<String>, DomainError> {
    for key in lookup_keys(qname) {
        if let Some(value) = store.get(&key).await? {
            debug!(key = %key, "Address store hit");
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn needs_rewrite(reply: &Message) -> bool {
    reply
        .answers()
        .iter()
        .any(|record| placeholder_type(record.data()).is_some())
}

fn placeholder_type(rdata: Option<&RData>) -> Option<RecordType> {
    match rdata {
        Some(RData::A(a)) if a.0.is_unspecified() => Some(RecordType::A),
        Some(RData::AAAA(aaaa)) if aaaa.0.is_unspecified() => Some(RecordType::AAAA),
        _ => None,
    }
}

fn as_ipv4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn as_ipv6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
