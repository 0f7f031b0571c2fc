//! garnet-persistence: durability layer.
//!
//! Two cooperating mechanisms: point-in-time text snapshots ([`rdb`])
//! and an append-only log of RESP-encoded write commands ([`aof`]) with
//! configurable fsync policies and online rewrite.

pub mod aof;
pub mod rdb;

pub use aof::{Aof, AofError, AofOptions, FsyncPolicy};
pub use rdb::{RdbError, RdbOptions};
