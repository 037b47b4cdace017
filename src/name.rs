//! DNS names as label sequences.
//!
//! Names are stored as owned label byte-vectors so hostile packets with
//! non-UTF-8 labels survive parsing intact. Comparison and hashing are
//! ASCII-case-insensitive, matching DNS name semantics; the original case is
//! preserved for display and for wire emission.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::proto::{self, MAX_NAME_LEN, MAX_POINTER_HOPS, POINTER_MASK};

/// A DNS name: zero or more labels. The root name has no labels.
#[derive(Clone, Debug, Default)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

impl Name {
    /// Parses a dotted name, validating every label and the total wire
    /// length. A single trailing dot (fully-qualified form) is accepted.
    pub fn from_str(name: &str) -> Result<Name> {
        proto::validate_name(name)?;
        let name = name.strip_suffix('.').unwrap_or(name);
        Ok(Name {
            labels: name
                .split('.')
                .map(|label| label.as_bytes().to_vec())
                .collect(),
        })
    }

    /// Returns `<label>.<self>`, validating the new leading label. Instance
    /// labels may contain any byte except `.`; the length and dash-edge
    /// rules still apply.
    pub fn prefixed(&self, label: &str) -> Result<Name> {
        if label.contains('.') {
            return Err(Error::validation(
                "label",
                label,
                "label may not contain '.'",
            ));
        }
        proto::validate_label(label)?;
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.as_bytes().to_vec());
        labels.extend(self.labels.iter().cloned());
        let name = Name { labels };
        if name.wire_len() > MAX_NAME_LEN {
            return Err(Error::validation(
                "name",
                name.to_string(),
                format!("name exceeds {} bytes in wire form", MAX_NAME_LEN),
            ));
        }
        Ok(name)
    }

    /// The labels, outermost first.
    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    /// First label rendered as text, if there is one.
    pub fn first_label(&self) -> Option<String> {
        self.labels
            .first()
            .map(|l| String::from_utf8_lossy(l).into_owned())
    }

    /// True if `suffix`'s labels are the tail of this name, case-insensitive.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let offset = self.labels.len() - suffix.labels.len();
        self.labels[offset..]
            .iter()
            .zip(suffix.labels.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Uncompressed wire length: one prefix byte per label, the label
    /// bytes, and the root terminator.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Reads a name from `msg` starting at `start`, following compression
    /// pointers. Returns the name and the offset just past it in the
    /// original (unjumped) byte stream.
    ///
    /// Pointer chains are bounded two ways: at most [`MAX_POINTER_HOPS`]
    /// hops, and every pointer must target an offset strictly before the
    /// pointer itself, which rules out self- and forward-references.
    pub fn parse(msg: &[u8], start: usize) -> Result<(Name, usize)> {
        let mut labels = Vec::new();
        let mut pos = start;
        let mut wire_len = 1usize;
        let mut hops = 0usize;
        let mut end = None;

        loop {
            let len_byte = *msg.get(pos).ok_or_else(|| Error::wire(pos))?;

            if len_byte & POINTER_MASK == POINTER_MASK {
                let low = *msg.get(pos + 1).ok_or_else(|| Error::wire(pos + 1))?;
                let target = usize::from(len_byte & !POINTER_MASK) << 8 | usize::from(low);
                if end.is_none() {
                    end = Some(pos + 2);
                }
                if target >= pos {
                    return Err(Error::wire(pos));
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(Error::wire(pos));
                }
                pos = target;
            } else if len_byte & POINTER_MASK != 0 {
                // 0x40 and 0x80 prefixes are reserved (RFC 1035 §4.1.4).
                return Err(Error::wire(pos));
            } else if len_byte == 0 {
                if end.is_none() {
                    end = Some(pos + 1);
                }
                break;
            } else {
                let len = usize::from(len_byte);
                let body = pos + 1;
                if body + len > msg.len() {
                    return Err(Error::wire(pos));
                }
                wire_len += 1 + len;
                if wire_len > MAX_NAME_LEN {
                    return Err(Error::wire(pos));
                }
                labels.push(msg[body..body + len].to_vec());
                pos = body + len;
            }
        }

        Ok((Name { labels }, end.expect("end recorded before loop exit")))
    }

    /// Appends this name to `out` uncompressed.
    pub fn write_uncompressed(&self, out: &mut Vec<u8>) {
        for label in &self.labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }

    /// Appends this name to `out`, compressing against suffixes already
    /// emitted at pointer-addressable offsets. `compress` maps canonical
    /// suffix keys to their absolute offsets and is updated as labels are
    /// written.
    pub fn write(&self, out: &mut Vec<u8>, compress: &mut HashMap<Vec<u8>, u16>) {
        for i in 0..self.labels.len() {
            let key = suffix_key(&self.labels[i..]);
            if let Some(&offset) = compress.get(&key) {
                out.push(POINTER_MASK | (offset >> 8) as u8);
                out.push(offset as u8);
                return;
            }
            let here = out.len();
            if here < 0x4000 {
                compress.insert(key, here as u16);
            }
            let label = &self.labels[i];
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }

    /// Canonical key for equality, hashing, and record identity:
    /// the lowercased uncompressed encoding.
    pub fn canonical_key(&self) -> Vec<u8> {
        suffix_key(&self.labels)
    }
}

fn suffix_key(labels: &[Vec<u8>]) -> Vec<u8> {
    let mut key = Vec::with_capacity(labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1);
    for label in labels {
        key.push(label.len() as u8);
        key.extend(label.iter().map(u8::to_ascii_lowercase));
    }
    key.push(0);
    key
}

impl PartialEq for Name {
    fn eq(&self, other: &Name) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            state.write_u8(label.len() as u8);
            for byte in label {
                state.write_u8(byte.to_ascii_lowercase());
            }
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", String::from_utf8_lossy(label))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_name() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x05_http\x04_tcp\x05local\x00");
        let (name, end) = Name::parse(&msg, 12).unwrap();
        assert_eq!(name.to_string(), "_http._tcp.local");
        assert_eq!(end, msg.len());
    }

    #[test]
    fn parse_follows_pointer() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x05_http\x04_tcp\x05local\x00"); // at 12
        let instance = msg.len();
        msg.extend_from_slice(b"\x07Printer\xc0\x0c");
        let (name, end) = Name::parse(&msg, instance).unwrap();
        assert_eq!(name.to_string(), "Printer._http._tcp.local");
        assert_eq!(end, msg.len());
    }

    #[test]
    fn pointer_past_end_is_rejected() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x03foo");
        msg.extend_from_slice(&[0xc0, 0xff]);
        // Target 0xff is past the end but also not strictly backward from
        // the pointer at offset 16.
        assert!(Name::parse(&msg, 12).is_err());
    }

    #[test]
    fn self_pointer_is_rejected() {
        let mut msg = vec![0u8; 12];
        let here = msg.len() as u8;
        msg.extend_from_slice(&[0xc0, here]);
        match Name::parse(&msg, 12) {
            Err(Error::WireFormat { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn forward_pointer_is_rejected() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xc0, 20]); // points forward
        msg.extend_from_slice(b"\x03foo\x00");
        assert!(Name::parse(&msg, 12).is_err());
    }

    #[test]
    fn pointer_ping_pong_terminates() {
        // A pair of pointers that reference each other; the backward rule
        // kills it on the second hop.
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xc0, 14, 0xc0, 12]);
        assert!(Name::parse(&msg, 14).is_err());
    }

    #[test]
    fn reserved_length_prefixes_are_rejected() {
        for prefix in &[0x40u8, 0x80] {
            let mut msg = vec![0u8; 12];
            msg.push(*prefix);
            msg.push(0);
            assert!(Name::parse(&msg, 12).is_err(), "prefix {:#x}", prefix);
        }
    }

    #[test]
    fn overlong_wire_name_is_rejected() {
        // Five 63-byte labels: 5*64 + 1 = 321 > 255.
        let mut msg = vec![0u8; 12];
        for _ in 0..5 {
            msg.push(63);
            msg.extend_from_slice(&[b'a'; 63]);
        }
        msg.push(0);
        assert!(Name::parse(&msg, 12).is_err());
    }

    #[test]
    fn truncated_label_is_rejected() {
        let msg = [5u8, b'h', b'i'];
        match Name::parse(&msg, 0) {
            Err(Error::WireFormat { offset }) => assert_eq!(offset, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn equality_ignores_case() {
        let a = Name::from_str("Printer._HTTP._tcp.LOCAL").unwrap();
        let b = Name::from_str("printer._http._TCP.local").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn ends_with_matches_service_types() {
        let fqdn = Name::from_str("Printer._http._tcp.local").unwrap();
        let ty = Name::from_str("_http._TCP.local").unwrap();
        let other = Name::from_str("_ipp._tcp.local").unwrap();
        assert!(fqdn.ends_with(&ty));
        assert!(!fqdn.ends_with(&other));
    }

    #[test]
    fn prefixed_builds_instance_names() {
        let ty = Name::from_str("_http._tcp.local").unwrap();
        let fqdn = ty.prefixed("My Printer").unwrap();
        assert_eq!(fqdn.to_string(), "My Printer._http._tcp.local");
        assert!(ty.prefixed("no.dots").is_err());
        assert!(ty.prefixed(&"x".repeat(64)).is_err());
    }

    #[test]
    fn compression_round_trip() {
        let mut out = vec![0u8; 12];
        let mut map = HashMap::new();
        let ty = Name::from_str("_http._tcp.local").unwrap();
        let fqdn = Name::from_str("Printer._http._tcp.local").unwrap();
        ty.write(&mut out, &mut map);
        let after_type = out.len();
        fqdn.write(&mut out, &mut map);

        // The second name is a single label plus a two-byte pointer.
        assert_eq!(out.len(), after_type + 1 + b"Printer".len() + 2);

        let (parsed_ty, _) = Name::parse(&out, 12).unwrap();
        let (parsed_fqdn, end) = Name::parse(&out, after_type).unwrap();
        assert_eq!(parsed_ty, ty);
        assert_eq!(parsed_fqdn, fqdn);
        assert_eq!(end, out.len());
    }

    #[test]
    fn wire_len_counts_prefixes_and_terminator() {
        let name = Name::from_str("_http._tcp.local").unwrap();
        assert_eq!(name.wire_len(), 1 + 5 + 1 + 4 + 1 + 5 + 1);
    }
}
