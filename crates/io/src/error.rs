//! Error types for the wire-encoding crate.
//!
//! Covers the byte-level failures that can occur while reading or writing
//! the fixed binary layouts used by the upcall/downcall pipe protocol and
//! the RPCSEC_GSS credential/verifier wire format.

use thiserror::Error;

/// Wire-encoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Attempted to read past the end of the buffer.
    #[error("unexpected end of stream: needed {needed} more bytes while reading {context}")]
    EndOfStream { needed: usize, context: &'static str },

    /// A length-prefixed field (netobj, downcall payload, upcall line) claimed
    /// a size that would overrun the caller's maximum.
    #[error("length {len} for {context} exceeds maximum {max}")]
    LengthOverrun {
        len: usize,
        max: usize,
        context: &'static str,
    },

    /// Bytes did not form valid UTF-8 where a string was expected.
    #[error("invalid UTF-8 in {context}: {reason}")]
    InvalidUtf8 { context: &'static str, reason: String },

    /// A v1 upcall line was malformed (missing key, bad delimiter, ...).
    #[error("malformed upcall line: {reason}")]
    MalformedUpcallLine { reason: String },

    /// Seek/skip target was out of bounds.
    #[error("position {position} out of bounds for buffer of length {len}")]
    OutOfBounds { position: usize, len: usize },
}

/// Result alias used throughout the wire-encoding crate.
pub type Result<T> = std::result::Result<T, IoError>;

impl IoError {
    pub fn end_of_stream(needed: usize, context: &'static str) -> Self {
        Self::EndOfStream { needed, context }
    }

    pub fn length_overrun(len: usize, max: usize, context: &'static str) -> Self {
        Self::LengthOverrun { len, max, context }
    }
}
