//! garnet-protocol: RESP2 wire protocol implementation.
//!
//! Provides an incremental, fragmentation-tolerant parser and
//! direct-to-buffer serialization of the RESP2 protocol used for
//! client-server communication and the AOF/replication streams.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use garnet_protocol::{Frame, FrameParser};
//!
//! let mut parser = FrameParser::new();
//! parser.append(b"+OK\r\n");
//! let frame = parser.try_parse().unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//!
//! let mut buf = BytesMut::new();
//! frame.serialize(&mut buf);
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::FrameParser;
pub use types::Frame;
