//! Error types for the responder and querier.
//!
//! Four kinds are distinguishable by matching on [`Error`]: invalid caller
//! input, malformed network data, transport failures, and cancellation.
//! Malformed packets never surface on the receive path; they are dropped
//! there, and [`Error::WireFormat`] only escapes through the public codec
//! entry points.

use std::error;
use std::fmt;
use std::io;

/// The error type used throughout the crate.
#[derive(Debug)]
pub enum Error {
    /// Caller-supplied input violates a documented rule. Never produced
    /// from network input.
    Validation {
        /// Which input field was rejected.
        field: &'static str,
        /// The offending value, rendered for diagnostics.
        value: String,
        /// What rule the value broke.
        message: String,
    },

    /// A received packet does not parse as a DNS message.
    WireFormat {
        /// Byte offset into the packet at which the violation was detected.
        offset: usize,
    },

    /// Transport-level I/O failure.
    Network {
        /// The operation that failed ("bind", "send", "join-multicast", ...).
        op: &'static str,
        source: io::Error,
    },

    /// The operation was abandoned before completion: its handle was
    /// dropped or the engine shut down underneath it.
    Cancelled,
}

impl Error {
    pub(crate) fn validation(
        field: &'static str,
        value: impl fmt::Display,
        message: impl Into<String>,
    ) -> Error {
        Error::Validation {
            field,
            value: value.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn wire(offset: usize) -> Error {
        Error::WireFormat { offset }
    }

    pub(crate) fn network(op: &'static str, source: io::Error) -> Error {
        Error::Network { op, source }
    }

    /// True if this error came from malformed network data.
    pub fn is_wire_format(&self) -> bool {
        match self {
            Error::WireFormat { .. } => true,
            _ => false,
        }
    }

    /// True if the operation was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Validation {
                field,
                value,
                message,
            } => write!(f, "invalid {}: {} ({:?})", field, message, value),
            Error::WireFormat { offset } => {
                write!(f, "malformed DNS message at byte {}", offset)
            }
            Error::Network { op, source } => write!(f, "network error during {}: {}", op, source),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Network { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Shorthand used by most fallible functions in the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let v = Error::validation("instance", "x".repeat(64), "label too long");
        let w = Error::wire(11);
        let n = Error::network("bind", io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        let c = Error::Cancelled;

        assert!(!v.is_wire_format() && !v.is_cancelled());
        assert!(w.is_wire_format());
        assert!(c.is_cancelled());
        match n {
            Error::Network { op: "bind", .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wire_error_reports_offset() {
        match Error::wire(42) {
            Error::WireFormat { offset } => assert_eq!(offset, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn network_error_exposes_source() {
        use std::error::Error as _;
        let err = Error::network("send", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
    }
}
