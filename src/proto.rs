//! Protocol constants and input validation.
//!
//! Pure leaf data shared by every other module: the mDNS port and group,
//! record types, header flag masks, the TTLs mandated by RFC 6762, and the
//! name/label limits from RFC 1035. Probe and announce cadence are RFC MUST
//! requirements and deliberately not configurable.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Standard mDNS port number.
pub const MDNS_PORT: u16 = 5353;

/// IPv4 multicast group for mDNS (RFC 6762 §3).
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Outgoing multicast TTL (RFC 6762 §11).
pub const MULTICAST_TTL: u32 = 255;

/// Upper bound on an mDNS packet, on the wire and in our buffers
/// (RFC 6762 §17).
pub const MAX_PACKET_SIZE: usize = 9000;

/// The Internet class.
pub const CLASS_IN: u16 = 1;

/// Mask selecting the class proper; the top bit is repurposed by mDNS.
pub const CLASS_MASK: u16 = 0x7fff;

/// Top bit of a record's class: the owner is authoritative and peer caches
/// should flush older records under the same name/type.
pub const CACHE_FLUSH: u16 = 0x8000;

/// Top bit of a question's class: a unicast response is preferred (QU).
pub const QU_UNICAST: u16 = 0x8000;

/// Header flag bits.
pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;
pub const FLAG_TC: u16 = 0x0200;
pub const FLAG_RD: u16 = 0x0100;

/// Opcode field inside the flags word; mDNS only ever uses zero.
pub const OPCODE_MASK: u16 = 0x7800;

/// Response-code field inside the flags word; mDNS only ever uses zero.
pub const RCODE_MASK: u16 = 0x000f;

/// Top two bits of a length byte marking a compression pointer.
pub const POINTER_MASK: u8 = 0xc0;

/// Longest permitted label, in bytes.
pub const MAX_LABEL_LEN: usize = 63;

/// Longest permitted name in wire form, length prefixes and the root
/// terminator included.
pub const MAX_NAME_LEN: usize = 255;

/// Upper bound on compression-pointer hops while decoding one name.
pub const MAX_POINTER_HOPS: usize = 256;

/// TTL for records tied to a hostname: A and SRV (RFC 6762 §10).
pub const TTL_HOST: u32 = 120;

/// TTL for service-level records: PTR and TXT (RFC 6762 §10).
pub const TTL_SERVICE: u32 = 4500;

/// Spacing between probe queries (RFC 6762 §8.1).
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Number of probe queries before a name is considered won.
pub const PROBE_COUNT: u32 = 3;

/// Spacing between unsolicited announcements (RFC 6762 §8.3).
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Number of unsolicited announcements after winning a name.
pub const ANNOUNCE_COUNT: u32 = 2;

/// Total naming attempts (original plus renames) before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 10;

/// Minimum spacing between multicasts of one record (RFC 6762 §6.2).
pub const RECORD_MULTICAST_INTERVAL: Duration = Duration::from_secs(1);

/// DNS-SD service-type enumeration name (RFC 6763 §9).
pub const META_QUERY: &str = "_services._dns-sd._udp.local";

/// The resource-record types this crate speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Srv,
    Any,
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
            RecordType::Any => 255,
        }
    }

    pub fn from_u16(value: u16) -> Option<RecordType> {
        match value {
            1 => Some(RecordType::A),
            12 => Some(RecordType::Ptr),
            16 => Some(RecordType::Txt),
            33 => Some(RecordType::Srv),
            255 => Some(RecordType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::Ptr => "PTR",
            RecordType::Txt => "TXT",
            RecordType::Srv => "SRV",
            RecordType::Any => "ANY",
        };
        f.write_str(s)
    }
}

/// Accepts the supported record types, rejects everything else.
pub fn validate_record_type(value: u16) -> Result<RecordType> {
    RecordType::from_u16(value)
        .ok_or_else(|| Error::validation("record type", value, "unsupported record type"))
}

/// Checks a single label against RFC 1035 limits as this crate emits them.
///
/// Labels are 1-63 bytes and may not start or end with `-`. Underscores are
/// fine; DNS-SD service labels depend on them.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::validation("label", label, "empty label"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(Error::validation(
            "label",
            label,
            format!("label exceeds {} bytes", MAX_LABEL_LEN),
        ));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(Error::validation(
            "label",
            label,
            "label may not start or end with '-'",
        ));
    }
    Ok(())
}

/// Checks a dotted name against the label rules and the 255-byte wire limit
/// (length prefixes and the root terminator included).
pub fn validate_name(name: &str) -> Result<()> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Err(Error::validation("name", name, "empty name"));
    }

    // Each label costs its length plus one prefix byte; the terminator
    // costs one more.
    let mut wire_len = 1;
    for label in name.split('.') {
        validate_label(label)?;
        wire_len += 1 + label.len();
    }
    if wire_len > MAX_NAME_LEN {
        return Err(Error::validation(
            "name",
            name,
            format!("name exceeds {} bytes in wire form", MAX_NAME_LEN),
        ));
    }
    Ok(())
}

/// RFC 6762 §18 gate for received responses: QR set, opcode zero, rcode
/// zero. Anything else is silently ignored by callers.
pub fn validate_response_flags(flags: u16) -> bool {
    flags & FLAG_QR != 0 && flags & OPCODE_MASK == 0 && flags & RCODE_MASK == 0
}

/// The complementary gate for received queries (RFC 6762 §18): QR clear,
/// opcode zero, rcode zero.
pub fn validate_query_flags(flags: u16) -> bool {
    flags & FLAG_QR == 0 && flags & OPCODE_MASK == 0 && flags & RCODE_MASK == 0
}
