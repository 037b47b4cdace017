//! Response construction for received queries.
//!
//! Given a query and the registry, this produces at most one reply:
//! answers that directly satisfy each question, correlated additionals that
//! save the querier a round trip, known-answer suppression, the 9000-byte
//! packet cap, the unicast-vs-multicast decision, and the once-per-second
//! per-record multicast throttle. Only Established services answer;
//! services still probing stay silent here and defend their names through
//! the probe tie-break instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::name::Name;
use crate::proto::{
    RecordType, MAX_PACKET_SIZE, META_QUERY, QU_UNICAST, RECORD_MULTICAST_INTERVAL, TTL_HOST,
    TTL_SERVICE,
};
use crate::services::{host_records, Phase, ServicesInner};
use crate::wire::{record, Message, RData, RecordKey, ResourceRecord};

/// A reply ready to send.
#[derive(Debug)]
pub struct Reply {
    pub message: Message,
    /// True when the reply should go back to the query source instead of
    /// the group.
    pub unicast: bool,
}

/// Per-responder reply state: when each record was last multicast.
pub struct ResponseState {
    last_multicast: HashMap<RecordKey, Instant>,
}

impl ResponseState {
    pub fn new() -> ResponseState {
        ResponseState {
            last_multicast: HashMap::new(),
        }
    }

    /// Records that `records` went out on the group at `now`. Announcements
    /// and goodbyes count toward the per-record throttle too.
    pub fn note_multicast(&mut self, records: &[ResourceRecord], now: Instant) {
        for rec in records {
            self.last_multicast.insert(rec.key(), now);
        }
    }

    fn multicast_within(&self, rec: &ResourceRecord, window: Duration, now: Instant) -> bool {
        self.last_multicast
            .get(&rec.key())
            .map(|&at| now.duration_since(at) <= window)
            .unwrap_or(false)
    }

    /// Builds the reply to `query`, if the registry is authoritative for
    /// anything it asks.
    pub fn build(
        &mut self,
        query: &Message,
        services: &ServicesInner,
        now: Instant,
    ) -> Option<Reply> {
        let mut answers: Vec<ResourceRecord> = Vec::new();
        let mut additionals: Vec<ResourceRecord> = Vec::new();
        let mut unicast_requested = false;

        for question in &query.questions {
            if question.qclass & QU_UNICAST != 0 {
                unicast_requested = true;
            }
            let qtype = match RecordType::from_u16(question.qtype) {
                Some(ty) => ty,
                None => continue,
            };
            lookup(services, &question.name, qtype, &mut answers, &mut additionals);
        }

        dedup(&mut answers);
        dedup(&mut additionals);
        // A record already going out as an answer need not repeat in the
        // additional section.
        let answer_keys: Vec<RecordKey> = answers.iter().map(|r| r.key()).collect();
        additionals.retain(|rec| !answer_keys.contains(&rec.key()));

        // Known-answer suppression (RFC 6762 §7.1): the querier told us
        // what it still holds; skip anything it holds at half TTL or more.
        answers.retain(|rec| !known(query, rec));
        additionals.retain(|rec| !known(query, rec));
        if answers.is_empty() {
            return None;
        }

        // Unicast only if requested and everything in the reply was on the
        // group within the last quarter TTL (RFC 6762 §5.4).
        let fresh = answers
            .iter()
            .chain(additionals.iter())
            .all(|rec| self.multicast_within(rec, Duration::from_secs(u64::from(rec.ttl) / 4), now));
        let unicast = unicast_requested && fresh;

        if !unicast {
            // At most one multicast per record per second (RFC 6762 §6.2);
            // in the one-response model a throttled record is omitted.
            answers.retain(|rec| !self.multicast_within(rec, RECORD_MULTICAST_INTERVAL, now));
            additionals.retain(|rec| !self.multicast_within(rec, RECORD_MULTICAST_INTERVAL, now));
            if answers.is_empty() {
                return None;
            }
        }

        let mut message = Message::response(query.header.id);
        message.answers = answers;
        message.additionals = additionals;

        // Fit the 9000-byte cap by shedding additionals, oldest first. The
        // answer section is never truncated.
        while message.wire_size() > MAX_PACKET_SIZE {
            if message.additionals.is_empty() {
                warn!(
                    "response of {} answer records cannot fit the packet cap; dropping reply",
                    message.answers.len()
                );
                return None;
            }
            message.additionals.remove(0);
        }

        if !unicast {
            let stamped: Vec<ResourceRecord> = message
                .answers
                .iter()
                .chain(message.additionals.iter())
                .cloned()
                .collect();
            self.note_multicast(&stamped, now);
        }

        debug!(
            "built reply: {} answers, {} additionals, unicast={}",
            message.answers.len(),
            message.additionals.len(),
            unicast
        );
        Some(Reply { message, unicast })
    }
}

/// Collects the answer and additional candidates for one question.
fn lookup(
    services: &ServicesInner,
    qname: &Name,
    qtype: RecordType,
    answers: &mut Vec<ResourceRecord>,
    additionals: &mut Vec<ResourceRecord>,
) {
    let hostname = services.hostname().clone();
    let addresses = services.addresses().to_vec();

    // Service-type enumeration (RFC 6763 §9): one PTR per distinct type.
    if let Ok(meta) = Name::from_str(META_QUERY) {
        if *qname == meta && (qtype == RecordType::Ptr || qtype == RecordType::Any) {
            for type_name in services.service_types() {
                let live = services
                    .find_by_type(&type_name)
                    .iter()
                    .any(|e| e.phase == Phase::Established);
                if live {
                    answers.push(record(
                        meta.clone(),
                        RecordType::Ptr,
                        false,
                        TTL_SERVICE,
                        RData::Ptr(type_name),
                    ));
                }
            }
            return;
        }
    }

    // PTR browse on a service type: PTR answers plus the full instance
    // detail as additionals.
    let by_type = services.find_by_type(qname);
    if !by_type.is_empty() {
        if qtype == RecordType::Ptr || qtype == RecordType::Any {
            for entry in by_type {
                if entry.phase != Phase::Established {
                    continue;
                }
                answers.push(entry.data.ptr_record(TTL_SERVICE));
                additionals.push(entry.data.srv_record(&hostname, TTL_HOST));
                additionals.push(entry.data.txt_record(TTL_SERVICE));
                additionals.extend(host_records(&hostname, &addresses, TTL_HOST));
            }
        }
        return;
    }

    // Direct questions on an instance name.
    if let Some(entry) = services.find_by_fqdn(qname) {
        if entry.phase != Phase::Established {
            return;
        }
        match qtype {
            RecordType::Srv => {
                answers.push(entry.data.srv_record(&hostname, TTL_HOST));
                additionals.extend(host_records(&hostname, &addresses, TTL_HOST));
            }
            RecordType::Txt => {
                answers.push(entry.data.txt_record(TTL_SERVICE));
            }
            RecordType::Any => {
                answers.push(entry.data.srv_record(&hostname, TTL_HOST));
                answers.push(entry.data.txt_record(TTL_SERVICE));
                additionals.extend(host_records(&hostname, &addresses, TTL_HOST));
            }
            _ => {}
        }
        return;
    }

    // Address questions on our hostname, once anything is established.
    if *qname == hostname && (qtype == RecordType::A || qtype == RecordType::Any) {
        let authoritative = services
            .instances()
            .iter()
            .any(|i| services.get(i).map(|e| e.phase == Phase::Established) == Some(true));
        if authoritative {
            answers.extend(host_records(&hostname, &addresses, TTL_HOST));
        }
    }
}

/// RFC 6762 §7.1: does the query's answer section already hold `rec` with
/// at least half its TTL remaining? The boundary is inclusive.
fn known(query: &Message, rec: &ResourceRecord) -> bool {
    let key = rec.key();
    query
        .answers
        .iter()
        .any(|held| held.key() == key && held.ttl >= rec.ttl / 2)
}

fn dedup(records: &mut Vec<ResourceRecord>) {
    let mut seen: Vec<RecordKey> = Vec::with_capacity(records.len());
    records.retain(|rec| {
        let key = rec.key();
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}
