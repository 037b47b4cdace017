//! DNS message parsing and building (RFC 1035 §4).
//!
//! The parser takes arbitrary bytes from the network and either produces a
//! [`Message`] or a `WireFormat` error carrying the offset where the
//! violation was detected. It never panics and never reads out of bounds;
//! every length and pointer is checked before use. The builder emits
//! messages with suffix compression on owner names and PTR targets.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::proto::{RecordType, CLASS_IN, CLASS_MASK, FLAG_AA, FLAG_QR};

/// Message header: the 16-bit ID and the 16-bit flags word. Section counts
/// are derived from the section vectors at build time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
}

/// One entry of the question section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

/// Typed RDATA for the record types this crate speaks. Anything else, and
/// any known-typed body that fails its own parse, is carried as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    /// TXT as its wire list of length-prefixed strings.
    Txt(Vec<Vec<u8>>),
    Other(Vec<u8>),
}

impl RData {
    /// Canonical uncompressed encoding, used for record identity, for
    /// known-answer matching, and for probe tie-breaking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::Ptr(name) => name.write_uncompressed(&mut out),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                let mut fixed = [0u8; 6];
                BigEndian::write_u16(&mut fixed[0..2], *priority);
                BigEndian::write_u16(&mut fixed[2..4], *weight);
                BigEndian::write_u16(&mut fixed[4..6], *port);
                out.extend_from_slice(&fixed);
                target.write_uncompressed(&mut out);
            }
            RData::Txt(strings) => {
                if strings.is_empty() {
                    // An empty TXT still carries one zero-length string.
                    out.push(0);
                } else {
                    for s in strings {
                        out.push(s.len() as u8);
                        out.extend_from_slice(s);
                    }
                }
            }
            RData::Other(bytes) => out.extend_from_slice(bytes),
        }
        out
    }
}

/// A resource record from any of the three record sections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: u16,
    /// Full class field; the top bit is the cache-flush flag.
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

/// Identity of a record for deduplication, known-answer matching, and the
/// per-record multicast throttle: case-folded name, type, class with the
/// cache-flush bit masked off, and the exact canonical RDATA bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    name: Vec<u8>,
    rtype: u16,
    class: u16,
    rdata: Vec<u8>,
}

impl ResourceRecord {
    pub fn new(name: Name, rtype: RecordType, class: u16, ttl: u32, rdata: RData) -> Self {
        ResourceRecord {
            name,
            rtype: rtype.to_u16(),
            class,
            ttl,
            rdata,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: self.name.canonical_key(),
            rtype: self.rtype,
            class: self.class & CLASS_MASK,
            rdata: self.rdata.to_bytes(),
        }
    }

    /// True if the cache-flush bit is set.
    pub fn cache_flush(&self) -> bool {
        self.class & !CLASS_MASK != 0
    }

    /// RFC 6762 §8.2.1 ordering for simultaneous-probe tie-breaking:
    /// class (sans cache-flush), then type, then raw RDATA bytes.
    pub fn tiebreak_cmp(&self, other: &ResourceRecord) -> Ordering {
        (self.class & CLASS_MASK)
            .cmp(&(other.class & CLASS_MASK))
            .then_with(|| self.rtype.cmp(&other.rtype))
            .then_with(|| self.rdata.to_bytes().cmp(&other.rdata.to_bytes()))
    }
}

/// A full DNS message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// A query carrying a single question.
    pub fn query(id: u16, name: Name, qtype: u16, qclass: u16) -> Message {
        Message {
            header: Header { id, flags: 0 },
            questions: vec![Question { name, qtype, qclass }],
            ..Message::default()
        }
    }

    /// An empty authoritative response (RFC 6762 §18: QR and AA set,
    /// opcode and rcode zero, no questions echoed).
    pub fn response(id: u16) -> Message {
        Message {
            header: Header {
                id,
                flags: FLAG_QR | FLAG_AA,
            },
            ..Message::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.header.flags & FLAG_QR != 0
    }

    /// Serializes the message. Section counts come from the section
    /// vectors; owner names and PTR targets are compressed against earlier
    /// emissions.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        let mut fixed = [0u8; 12];
        BigEndian::write_u16(&mut fixed[0..2], self.header.id);
        BigEndian::write_u16(&mut fixed[2..4], self.header.flags);
        BigEndian::write_u16(&mut fixed[4..6], self.questions.len() as u16);
        BigEndian::write_u16(&mut fixed[6..8], self.answers.len() as u16);
        BigEndian::write_u16(&mut fixed[8..10], self.authorities.len() as u16);
        BigEndian::write_u16(&mut fixed[10..12], self.additionals.len() as u16);
        out.extend_from_slice(&fixed);

        let mut compress = HashMap::new();
        for q in &self.questions {
            q.name.write(&mut out, &mut compress);
            push_u16(&mut out, q.qtype);
            push_u16(&mut out, q.qclass);
        }
        for section in &[&self.answers, &self.authorities, &self.additionals] {
            for record in section.iter() {
                write_record(record, &mut out, &mut compress);
            }
        }
        out
    }

    /// Serialized size without serializing twice.
    pub fn wire_size(&self) -> usize {
        self.to_bytes().len()
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn write_record(record: &ResourceRecord, out: &mut Vec<u8>, compress: &mut HashMap<Vec<u8>, u16>) {
    record.name.write(out, compress);
    push_u16(out, record.rtype);
    push_u16(out, record.class);
    push_u32(out, record.ttl);

    // Reserve the length and patch it once the body is written; PTR
    // targets may compress to an unpredictable size.
    let len_at = out.len();
    push_u16(out, 0);
    let body_at = out.len();
    match &record.rdata {
        RData::A(addr) => out.extend_from_slice(&addr.octets()),
        RData::Ptr(name) => name.write(out, compress),
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            push_u16(out, *priority);
            push_u16(out, *weight);
            push_u16(out, *port);
            // SRV targets are never compressed (RFC 2782).
            target.write_uncompressed(out);
        }
        RData::Txt(strings) => {
            if strings.is_empty() {
                out.push(0);
            } else {
                for s in strings {
                    out.push(s.len() as u8);
                    out.extend_from_slice(s);
                }
            }
        }
        RData::Other(bytes) => out.extend_from_slice(bytes),
    }
    let rdlength = (out.len() - body_at) as u16;
    BigEndian::write_u16(&mut out[len_at..len_at + 2], rdlength);
}

/// Parses a message from untrusted bytes.
pub fn parse(data: &[u8]) -> Result<Message> {
    if data.len() < 12 {
        return Err(Error::wire(0));
    }
    let header = Header {
        id: BigEndian::read_u16(&data[0..2]),
        flags: BigEndian::read_u16(&data[2..4]),
    };
    let qd_count = BigEndian::read_u16(&data[4..6]);
    let an_count = BigEndian::read_u16(&data[6..8]);
    let ns_count = BigEndian::read_u16(&data[8..10]);
    let ar_count = BigEndian::read_u16(&data[10..12]);

    let mut pos = 12;
    let mut questions = Vec::with_capacity(usize::from(qd_count).min(32));
    for _ in 0..qd_count {
        let (question, next) = parse_question(data, pos)?;
        questions.push(question);
        pos = next;
    }

    let mut sections = [
        Vec::with_capacity(usize::from(an_count).min(32)),
        Vec::with_capacity(usize::from(ns_count).min(32)),
        Vec::with_capacity(usize::from(ar_count).min(32)),
    ];
    for (section, count) in sections.iter_mut().zip(&[an_count, ns_count, ar_count]) {
        for _ in 0..*count {
            let (record, next) = parse_record(data, pos)?;
            section.push(record);
            pos = next;
        }
    }
    let [answers, authorities, additionals] = sections;

    Ok(Message {
        header,
        questions,
        answers,
        authorities,
        additionals,
    })
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    if pos + 2 > data.len() {
        return Err(Error::wire(pos));
    }
    Ok(BigEndian::read_u16(&data[pos..pos + 2]))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    if pos + 4 > data.len() {
        return Err(Error::wire(pos));
    }
    Ok(BigEndian::read_u32(&data[pos..pos + 4]))
}

fn parse_question(data: &[u8], pos: usize) -> Result<(Question, usize)> {
    let (name, pos) = Name::parse(data, pos)?;
    let qtype = read_u16(data, pos)?;
    let qclass = read_u16(data, pos + 2)?;
    Ok((
        Question {
            name,
            qtype,
            qclass,
        },
        pos + 4,
    ))
}

fn parse_record(data: &[u8], pos: usize) -> Result<(ResourceRecord, usize)> {
    let (name, pos) = Name::parse(data, pos)?;
    let rtype = read_u16(data, pos)?;
    let class = read_u16(data, pos + 2)?;
    let ttl = read_u32(data, pos + 4)?;
    let rdlength = usize::from(read_u16(data, pos + 8)?);
    let body = pos + 10;
    if body + rdlength > data.len() {
        return Err(Error::wire(pos + 8));
    }
    let rdata = parse_rdata(data, body, rdlength, rtype);
    Ok((
        ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        body + rdlength,
    ))
}

/// Decodes a typed RDATA body. A malformed body of a known type degrades
/// to raw bytes so one bad record cannot take the whole message down.
fn parse_rdata(data: &[u8], body: usize, rdlength: usize, rtype: u16) -> RData {
    let raw = &data[body..body + rdlength];
    match RecordType::from_u16(rtype) {
        Some(RecordType::A) => {
            if rdlength == 4 {
                RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            } else {
                RData::Other(raw.to_vec())
            }
        }
        Some(RecordType::Ptr) => match Name::parse(data, body) {
            Ok((target, end)) if end <= body + rdlength => RData::Ptr(target),
            _ => RData::Other(raw.to_vec()),
        },
        Some(RecordType::Srv) => {
            if rdlength < 7 {
                return RData::Other(raw.to_vec());
            }
            let priority = BigEndian::read_u16(&raw[0..2]);
            let weight = BigEndian::read_u16(&raw[2..4]);
            let port = BigEndian::read_u16(&raw[4..6]);
            match Name::parse(data, body + 6) {
                Ok((target, end)) if end <= body + rdlength => RData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                },
                _ => RData::Other(raw.to_vec()),
            }
        }
        Some(RecordType::Txt) => {
            let mut strings = Vec::new();
            let mut at = 0;
            while at < raw.len() {
                let len = usize::from(raw[at]);
                at += 1;
                if at + len > raw.len() {
                    return RData::Other(raw.to_vec());
                }
                strings.push(raw[at..at + len].to_vec());
                at += len;
            }
            RData::Txt(strings)
        }
        _ => RData::Other(raw.to_vec()),
    }
}

/// Convenience: an IN-class record with optional cache-flush.
pub fn record(
    name: Name,
    rtype: RecordType,
    cache_flush: bool,
    ttl: u32,
    rdata: RData,
) -> ResourceRecord {
    let class = if cache_flush {
        CLASS_IN | !CLASS_MASK
    } else {
        CLASS_IN
    };
    ResourceRecord::new(name, rtype, class, ttl, rdata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CACHE_FLUSH, RecordType};

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn query_wire_bytes_are_exact() {
        let msg = Message::query(0x1234, name("_http._tcp.local"), 12, 1);
        let bytes = msg.to_bytes();
        let expected: &[u8] = &[
            0x12, 0x34, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, b'_',
            b'h', b't', b't', b'p', 0x04, b'_', b't', b'c', b'p', 0x05, b'l', b'o', b'c', b'a',
            b'l', 0x00, 0x00, 0x0c, 0x00, 0x01,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn header_only_packet_parses_empty() {
        let msg = parse(&[0u8; 12]).unwrap();
        assert_eq!(msg.header, Header { id: 0, flags: 0 });
        assert!(msg.questions.is_empty());
        assert!(msg.answers.is_empty());
        assert!(msg.authorities.is_empty());
        assert!(msg.additionals.is_empty());
    }

    #[test]
    fn short_packet_errors_at_offset_zero() {
        match parse(&[0u8; 11]) {
            Err(Error::WireFormat { offset }) => assert_eq!(offset, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn counts_beyond_data_are_rejected() {
        let mut bytes = vec![0u8; 12];
        bytes[5] = 3; // three questions, no bytes
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn round_trips_a_full_message() {
        let mut msg = Message::response(0);
        msg.answers.push(record(
            name("_http._tcp.local"),
            RecordType::Ptr,
            false,
            4500,
            RData::Ptr(name("Printer._http._tcp.local")),
        ));
        msg.additionals.push(record(
            name("Printer._http._tcp.local"),
            RecordType::Srv,
            true,
            120,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 8080,
                target: name("host.local"),
            },
        ));
        msg.additionals.push(record(
            name("Printer._http._tcp.local"),
            RecordType::Txt,
            true,
            4500,
            RData::Txt(vec![b"path=/".to_vec()]),
        ));
        msg.additionals.push(record(
            name("host.local"),
            RecordType::A,
            true,
            120,
            RData::A(Ipv4Addr::new(192, 168, 1, 10)),
        ));

        let parsed = parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trip_preserves_empty_txt() {
        let mut msg = Message::response(0);
        msg.answers.push(record(
            name("a.local"),
            RecordType::Txt,
            true,
            4500,
            RData::Txt(vec![]),
        ));
        let parsed = parse(&msg.to_bytes()).unwrap();
        // The wire carries a single empty string for an empty TXT.
        assert_eq!(
            parsed.answers[0].rdata,
            RData::Txt(vec![Vec::new()]),
        );
    }

    #[test]
    fn cache_flush_bit_round_trips() {
        let rec = record(
            name("host.local"),
            RecordType::A,
            true,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert!(rec.cache_flush());
        assert_eq!(rec.class, 0x8001);

        let mut msg = Message::response(0);
        msg.answers.push(rec);
        let parsed = parse(&msg.to_bytes()).unwrap();
        assert!(parsed.answers[0].cache_flush());
    }

    #[test]
    fn record_key_masks_cache_flush() {
        let flushed = record(
            name("Host.local"),
            RecordType::A,
            true,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        let plain = record(
            name("host.LOCAL"),
            RecordType::A,
            false,
            999,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        // Same identity: name case, cache-flush bit, and TTL are not part
        // of the key.
        assert_eq!(flushed.key(), plain.key());

        let other = record(
            name("host.local"),
            RecordType::A,
            false,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 2)),
        );
        assert_ne!(flushed.key(), other.key());
        assert_eq!(flushed.class & CACHE_FLUSH, CACHE_FLUSH);
    }

    #[test]
    fn malformed_srv_degrades_to_raw() {
        let mut bytes = vec![0u8; 12];
        bytes[7] = 1; // one answer
        bytes.extend_from_slice(b"\x01a\x00"); // name "a"
        bytes.extend_from_slice(&[0x00, 33]); // SRV
        bytes.extend_from_slice(&[0x00, 0x01]); // IN
        bytes.extend_from_slice(&[0, 0, 0, 120]); // TTL
        bytes.extend_from_slice(&[0x00, 0x03]); // rdlength 3: too short
        bytes.extend_from_slice(&[1, 2, 3]);

        let msg = parse(&bytes).unwrap();
        assert_eq!(msg.answers[0].rdata, RData::Other(vec![1, 2, 3]));
    }

    #[test]
    fn rdata_running_past_packet_is_rejected() {
        let mut bytes = vec![0u8; 12];
        bytes[7] = 1;
        bytes.extend_from_slice(b"\x01a\x00");
        bytes.extend_from_slice(&[0x00, 1]); // A
        bytes.extend_from_slice(&[0x00, 0x01]);
        bytes.extend_from_slice(&[0, 0, 0, 120]);
        bytes.extend_from_slice(&[0x00, 0x08]); // claims 8 bytes
        bytes.extend_from_slice(&[10, 0, 0, 1]); // only 4 present
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn compressed_names_inside_rdata_parse() {
        // PTR answer whose target reuses the question name suffix.
        let mut msg = Message::query(0, name("_http._tcp.local"), 12, 1);
        msg.header.flags = FLAG_QR | FLAG_AA;
        msg.answers.push(record(
            name("_http._tcp.local"),
            RecordType::Ptr,
            false,
            4500,
            RData::Ptr(name("Printer._http._tcp.local")),
        ));
        let bytes = msg.to_bytes();
        let parsed = parse(&bytes).unwrap();
        match &parsed.answers[0].rdata {
            RData::Ptr(target) => {
                assert_eq!(target, &name("Printer._http._tcp.local"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Compression actually happened: the encoded form is smaller than
        // the uncompressed name lengths would demand.
        assert!(bytes.len() < 12 + 2 * name("_http._tcp.local").wire_len() + 32);
    }

    #[test]
    fn tiebreak_orders_by_class_type_then_rdata() {
        let a = record(
            name("x.local"),
            RecordType::A,
            false,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        let b = record(
            name("x.local"),
            RecordType::A,
            false,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 2)),
        );
        assert_eq!(a.tiebreak_cmp(&b), Ordering::Less);
        assert_eq!(b.tiebreak_cmp(&a), Ordering::Greater);

        let srv = record(
            name("x.local"),
            RecordType::Srv,
            false,
            120,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 1,
                target: name("h.local"),
            },
        );
        // SRV (33) sorts after A (1) regardless of rdata.
        assert_eq!(a.tiebreak_cmp(&srv), Ordering::Less);

        // The cache-flush bit does not participate.
        let flushed = record(
            name("x.local"),
            RecordType::A,
            true,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert_eq!(a.tiebreak_cmp(&flushed), Ordering::Equal);
    }

    #[test]
    fn txt_strings_round_trip() {
        let rdata = RData::Txt(vec![b"path=/".to_vec(), b"version=1.0".to_vec()]);
        let bytes = rdata.to_bytes();
        assert_eq!(bytes[0], 6);
        assert_eq!(&bytes[1..7], b"path=/");
        assert_eq!(bytes[7], 11);
    }
}
