//! The keyspace: typed records, TTL index, expiration.
//!
//! Three disjoint maps (strings, hashes, sorted sets) keyed by opaque
//! bytes, plus one eagerly-maintained TTL index across all of them. A
//! key lives in at most one map at a time; commands against a key of
//! another type fail with [`WrongType`].
//!
//! Expiration is lazy on every touch (a reader never observes an
//! expired key) and active via [`Engine::expire_scan_step`], which an
//! external timer drives.
//!
//! All operations run under one mutex held for the duration of the
//! call; the [`Engine`] handle is a cheap-clone `Arc` around it. No
//! operation blocks on I/O or re-enters user code while holding the
//! lock.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::time;

mod hash;
mod string;
mod zset;

pub use zset::ZSET_VECTOR_THRESHOLD;

/// Error returned when a command is used against a key holding the
/// wrong kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

impl std::fmt::Display for WrongType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        )
    }
}

impl std::error::Error for WrongType {}

/// TTL query result, following Redis conventions.
pub type TtlResult = i64;

/// A string record: opaque bytes plus an absolute expiry deadline.
/// `expire_at_ms < 0` means no expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringRecord {
    pub value: Bytes,
    pub expire_at_ms: i64,
}

/// A hash record: field → value map plus an expiry deadline.
#[derive(Debug, Clone)]
pub struct HashRecord {
    pub fields: HashMap<Bytes, Bytes>,
    pub expire_at_ms: i64,
}

pub use zset::ZSetRecord;

/// A sorted set flattened for snapshots: items in rank order,
/// independent of the live representation.
#[derive(Debug, Clone)]
pub struct ZSetFlat {
    pub key: Bytes,
    pub items: Vec<(f64, Bytes)>,
    pub expire_at_ms: i64,
}

pub(crate) struct Store {
    strings: HashMap<Bytes, StringRecord>,
    hashes: HashMap<Bytes, HashRecord>,
    zsets: HashMap<Bytes, ZSetRecord>,
    /// key → absolute deadline, for every key with `expire_at_ms >= 0`
    /// in any of the three maps. Ordered so the sweep can resume from a
    /// saved cursor.
    expire_index: BTreeMap<Bytes, i64>,
    /// Last key visited by the sweep; the next call resumes after it.
    scan_cursor: Option<Bytes>,
    rng: SmallRng,
}

impl Store {
    fn new() -> Self {
        Self {
            strings: HashMap::new(),
            hashes: HashMap::new(),
            zsets: HashMap::new(),
            expire_index: BTreeMap::new(),
            scan_cursor: None,
            rng: SmallRng::from_os_rng(),
        }
    }

    // -- TTL index maintenance --

    /// Records or clears the TTL index entry for `key`.
    fn index_expiry(&mut self, key: &Bytes, expire_at_ms: i64) {
        if expire_at_ms >= 0 {
            self.expire_index.insert(key.clone(), expire_at_ms);
        } else {
            self.expire_index.remove(key.as_ref() as &[u8]);
        }
    }

    fn drop_expiry(&mut self, key: &[u8]) {
        self.expire_index.remove(key);
    }

    // -- lazy expiration --
    //
    // Every read and write path calls the guard for the map it touches
    // before observing state; cross-map operations (DEL, EXISTS, type
    // checks) expire the key in all three.

    fn expire_string_if_due(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.strings.get(key) {
            if time::is_expired(rec.expire_at_ms, now) {
                self.strings.remove(key);
                self.drop_expiry(key);
            }
        }
    }

    fn expire_hash_if_due(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.hashes.get(key) {
            if time::is_expired(rec.expire_at_ms, now) {
                self.hashes.remove(key);
                self.drop_expiry(key);
            }
        }
    }

    fn expire_zset_if_due(&mut self, key: &[u8], now: i64) {
        if let Some(rec) = self.zsets.get(key) {
            if time::is_expired(rec.expire_at_ms, now) {
                self.zsets.remove(key);
                self.drop_expiry(key);
            }
        }
    }

    fn expire_any_if_due(&mut self, key: &[u8], now: i64) {
        self.expire_string_if_due(key, now);
        self.expire_hash_if_due(key, now);
        self.expire_zset_if_due(key, now);
    }

    // -- cross-type operations --

    fn del(&mut self, keys: &[Bytes]) -> usize {
        let now = time::now_ms();
        let mut removed = 0;
        for key in keys {
            let key = key.as_ref() as &[u8];
            self.expire_any_if_due(key, now);
            let hit = self.strings.remove(key).is_some()
                || self.hashes.remove(key).is_some()
                || self.zsets.remove(key).is_some();
            if hit {
                self.drop_expiry(key);
                removed += 1;
            }
        }
        removed
    }

    fn exists(&mut self, key: &[u8]) -> bool {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
    }

    /// Applies an absolute deadline to whichever typed record holds the
    /// key. Used when replaying the rewrite's EXPIREAT-equivalent.
    fn set_key_expire_at_ms(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        if self.strings.contains_key(key) {
            return self.set_string_expire_at_ms(key, expire_at_ms);
        }
        if self.hashes.contains_key(key) {
            return self.set_hash_expire_at_ms(key, expire_at_ms);
        }
        if self.zsets.contains_key(key) {
            return self.set_zset_expire_at_ms(key, expire_at_ms);
        }
        false
    }

    // -- active expiration sweep --

    fn expire_scan_step(&mut self, max_steps: usize) -> usize {
        if max_steps == 0 || self.expire_index.is_empty() {
            return 0;
        }
        let now = time::now_ms();
        let len = self.expire_index.len();
        let steps = max_steps.min(len);

        // collect the keys to visit: resume after the saved cursor, or
        // start at a pseudo-random offset; wrap at the end
        let mut visit: Vec<Bytes> = Vec::with_capacity(steps);
        match self.scan_cursor.take() {
            Some(cursor) => {
                let after = (Bound::Excluded(cursor.as_ref() as &[u8]), Bound::Unbounded);
                visit.extend(
                    self.expire_index
                        .range::<[u8], _>(after)
                        .take(steps)
                        .map(|(k, _)| k.clone()),
                );
            }
            None => {
                let skip = self.rng.random_range(0..len);
                visit.extend(self.expire_index.keys().skip(skip).take(steps).cloned());
            }
        }
        if visit.len() < steps {
            let wrapped: Vec<Bytes> = self
                .expire_index
                .keys()
                .take(steps - visit.len())
                .cloned()
                .collect();
            for key in wrapped {
                if !visit.contains(&key) {
                    visit.push(key);
                }
            }
        }
        self.scan_cursor = visit.last().cloned();

        let mut removed = 0;
        for key in visit {
            let key = key.as_ref() as &[u8];
            let Some(&deadline) = self.expire_index.get(key) else {
                continue;
            };
            if time::is_expired(deadline, now) {
                self.strings.remove(key);
                self.hashes.remove(key);
                self.zsets.remove(key);
                self.drop_expiry(key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expiration sweep evicted keys");
        }
        removed
    }

    // -- snapshots for persistence --

    fn snapshot_strings(&self) -> Vec<(Bytes, StringRecord)> {
        self.strings
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    fn snapshot_hashes(&self) -> Vec<(Bytes, HashRecord)> {
        self.hashes
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    fn snapshot_zsets(&self) -> Vec<ZSetFlat> {
        self.zsets
            .iter()
            .map(|(k, rec)| ZSetFlat {
                key: k.clone(),
                items: rec.items_in_order(),
                expire_at_ms: rec.expire_at_ms,
            })
            .collect()
    }

    fn list_keys(&self) -> Vec<Bytes> {
        let mut out: Vec<Bytes> =
            Vec::with_capacity(self.strings.len() + self.hashes.len() + self.zsets.len());
        out.extend(self.strings.keys().cloned());
        out.extend(self.hashes.keys().cloned());
        out.extend(self.zsets.keys().cloned());
        out.sort();
        out.dedup();
        out
    }
}

/// Cheap-clone handle to the keyspace. Every method acquires the engine
/// mutex for its full duration.
#[derive(Clone)]
pub struct Engine {
    store: Arc<Mutex<Store>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::new())),
        }
    }

    // -- string ops (see store/string.rs for record-level semantics) --

    pub fn set(&self, key: &[u8], value: Bytes, ttl_ms: Option<i64>) -> Result<(), WrongType> {
        self.store.lock().set(key, value, ttl_ms)
    }

    pub fn set_with_expire_at_ms(
        &self,
        key: &[u8],
        value: Bytes,
        expire_at_ms: i64,
    ) -> Result<(), WrongType> {
        self.store.lock().set_with_expire_at_ms(key, value, expire_at_ms)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.store.lock().get(key)
    }

    pub fn expire(&self, key: &[u8], ttl_seconds: i64) -> bool {
        self.store.lock().expire(key, ttl_seconds)
    }

    pub fn ttl(&self, key: &[u8]) -> TtlResult {
        self.store.lock().ttl(key)
    }

    // -- cross-type ops --

    pub fn del(&self, keys: &[Bytes]) -> usize {
        self.store.lock().del(keys)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.store.lock().exists(key)
    }

    pub fn set_key_expire_at_ms(&self, key: &[u8], expire_at_ms: i64) -> bool {
        self.store.lock().set_key_expire_at_ms(key, expire_at_ms)
    }

    pub fn expire_scan_step(&self, max_steps: usize) -> usize {
        self.store.lock().expire_scan_step(max_steps)
    }

    pub fn list_keys(&self) -> Vec<Bytes> {
        self.store.lock().list_keys()
    }

    /// Number of keys currently carrying an expiration.
    pub fn expiring_key_count(&self) -> usize {
        self.store.lock().expire_index.len()
    }

    /// Total number of live keys across all three maps.
    pub fn key_count(&self) -> usize {
        let store = self.store.lock();
        store.strings.len() + store.hashes.len() + store.zsets.len()
    }

    // -- hash ops --

    pub fn hset(&self, key: &[u8], field: Bytes, value: Bytes) -> Result<i64, WrongType> {
        self.store.lock().hset(key, field, value)
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.store.lock().hget(key, field)
    }

    pub fn hdel(&self, key: &[u8], fields: &[Bytes]) -> Result<usize, WrongType> {
        self.store.lock().hdel(key, fields)
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool, WrongType> {
        self.store.lock().hexists(key, field)
    }

    pub fn hgetall_flat(&self, key: &[u8]) -> Result<Vec<Bytes>, WrongType> {
        self.store.lock().hgetall_flat(key)
    }

    pub fn hlen(&self, key: &[u8]) -> Result<usize, WrongType> {
        self.store.lock().hlen(key)
    }

    pub fn set_hash_expire_at_ms(&self, key: &[u8], expire_at_ms: i64) -> bool {
        self.store.lock().set_hash_expire_at_ms(key, expire_at_ms)
    }

    // -- sorted-set ops --

    pub fn zadd(&self, key: &[u8], score: f64, member: Bytes) -> Result<i64, WrongType> {
        self.store.lock().zadd(key, score, member)
    }

    pub fn zrem(&self, key: &[u8], members: &[Bytes]) -> Result<usize, WrongType> {
        self.store.lock().zrem(key, members)
    }

    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, WrongType> {
        self.store.lock().zrange(key, start, stop)
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>, WrongType> {
        self.store.lock().zscore(key, member)
    }

    pub fn set_zset_expire_at_ms(&self, key: &[u8], expire_at_ms: i64) -> bool {
        self.store.lock().set_zset_expire_at_ms(key, expire_at_ms)
    }

    /// Reports whether a sorted set currently uses the skiplist
    /// representation (promotion is one-way).
    pub fn zset_uses_skiplist(&self, key: &[u8]) -> Option<bool> {
        self.store.lock().zsets.get(key).map(|r| r.uses_skiplist())
    }

    // -- point-in-time snapshots, taken under the engine mutex --

    pub fn snapshot_strings(&self) -> Vec<(Bytes, StringRecord)> {
        self.store.lock().snapshot_strings()
    }

    pub fn snapshot_hashes(&self) -> Vec<(Bytes, HashRecord)> {
        self.store.lock().snapshot_hashes()
    }

    pub fn snapshot_zsets(&self) -> Vec<ZSetFlat> {
        self.store.lock().snapshot_zsets()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
