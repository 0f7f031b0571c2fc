//! RESP2 frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP2 value.
//! Bulk strings use `Bytes` for reference-counted storage that avoids
//! copies when values move between the parser, the keyspace, the AOF
//! queue and the replication stream.

use bytes::Bytes;

/// A single RESP2 protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string, e.g. `+OK\r\n`. Short, non-binary status replies.
    Simple(String),

    /// Error, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Null bulk string, `$-1\r\n`. The "no value" reply.
    NullBulk,

    /// Ordered array of frames, e.g. `*2\r\n+a\r\n+b\r\n`. May nest.
    Array(Vec<Frame>),

    /// Null array, `*-1\r\n`.
    NullArray,
}

impl Frame {
    /// Returns the bulk payload if this frame is a bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Builds a bulk frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_equality() {
        assert_eq!(Frame::Simple("OK".into()), Frame::Simple("OK".into()));
        assert_ne!(Frame::Simple("OK".into()), Frame::Error("OK".into()));
        assert_eq!(Frame::NullBulk, Frame::NullBulk);
        assert_ne!(Frame::NullBulk, Frame::NullArray);
    }

    #[test]
    fn as_bulk() {
        let frame = Frame::bulk("hello");
        assert_eq!(frame.as_bulk(), Some(&Bytes::from_static(b"hello")));
        assert_eq!(Frame::Integer(1).as_bulk(), None);
    }
}
