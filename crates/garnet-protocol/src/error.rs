//! Protocol error types for RESP2 parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP2 wire format.
///
/// Everything except [`ProtocolError::Incomplete`] is fatal for the
/// connection: the byte stream is no longer frame-aligned and the
/// dispatcher must close it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known RESP2 type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the frame content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length. `-1` is the
    /// null sentinel; anything else below zero is a framing violation.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk string declared a length above the implementation maximum.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    /// An array declared more elements than the implementation maximum.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// Arrays nested deeper than the implementation maximum.
    #[error("nesting exceeds {0} levels")]
    NestingTooDeep(usize),
}
