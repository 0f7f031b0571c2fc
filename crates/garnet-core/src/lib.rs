//! garnet-core: the storage engine.
//!
//! Owns the typed keyspace (strings, hashes, sorted sets), the TTL
//! index with lazy and active expiration, and the sorted-set skiplist.
//! All public operations run under a single engine mutex; the
//! [`Engine`] handle is cheap to clone and is passed explicitly to the
//! dispatcher, the persistence layer and the replica client.

pub mod skiplist;
pub mod store;
pub mod time;

pub use skiplist::Skiplist;
pub use store::{
    Engine, HashRecord, StringRecord, TtlResult, WrongType, ZSetFlat, ZSetRecord,
    ZSET_VECTOR_THRESHOLD,
};
