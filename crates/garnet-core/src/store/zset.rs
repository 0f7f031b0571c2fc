//! Sorted-set record operations.
//!
//! Each record keeps two indices that agree at every observable moment:
//! a rank index ordered by (score, member) and a member → score map for
//! O(1) lookups. The rank index starts as a compact sorted vector and
//! promotes to a skiplist once it outgrows [`ZSET_VECTOR_THRESHOLD`];
//! promotion is one-way for the life of the record.

use super::*;
use crate::skiplist::{pair_less, scores_equal, Skiplist};

/// Size above which the compact vector promotes to a skiplist.
pub const ZSET_VECTOR_THRESHOLD: usize = 128;

#[derive(Debug)]
enum RankIndex {
    Compact(Vec<(f64, Bytes)>),
    Skiplist(Skiplist),
}

/// A sorted set: rank index + score index + expiry deadline.
#[derive(Debug)]
pub struct ZSetRecord {
    rank: RankIndex,
    scores: HashMap<Bytes, f64>,
    pub expire_at_ms: i64,
}

impl ZSetRecord {
    fn new() -> Self {
        Self {
            rank: RankIndex::Compact(Vec::new()),
            scores: HashMap::new(),
            expire_at_ms: time::NO_EXPIRY,
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn uses_skiplist(&self) -> bool {
        matches!(self.rank, RankIndex::Skiplist(_))
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// All (score, member) pairs in rank order, regardless of the
    /// current representation.
    pub fn items_in_order(&self) -> Vec<(f64, Bytes)> {
        match &self.rank {
            RankIndex::Compact(vec) => vec.clone(),
            RankIndex::Skiplist(sl) => {
                let mut out = Vec::new();
                sl.to_vector(&mut out);
                out
            }
        }
    }

    fn rank_insert(&mut self, score: f64, member: Bytes) {
        let outgrown = match &mut self.rank {
            RankIndex::Compact(vec) => {
                let pos = vec.partition_point(|(s, m)| pair_less(*s, m, score, &member));
                vec.insert(pos, (score, member));
                vec.len() > ZSET_VECTOR_THRESHOLD
            }
            RankIndex::Skiplist(sl) => {
                sl.insert(score, member);
                false
            }
        };
        if outgrown {
            self.promote();
        }
    }

    fn rank_remove(&mut self, score: f64, member: &[u8]) {
        match &mut self.rank {
            RankIndex::Compact(vec) => {
                if let Some(pos) = vec
                    .iter()
                    .position(|(s, m)| scores_equal(*s, score) && m == member)
                {
                    vec.remove(pos);
                }
            }
            RankIndex::Skiplist(sl) => {
                sl.erase(score, member);
            }
        }
    }

    fn promote(&mut self) {
        let RankIndex::Compact(vec) = &mut self.rank else {
            return;
        };
        let mut sl = Skiplist::new();
        for (score, member) in vec.drain(..) {
            sl.insert(score, member);
        }
        self.rank = RankIndex::Skiplist(sl);
    }

    fn rank_range(&self, start: i64, stop: i64) -> Vec<Bytes> {
        let mut out = Vec::new();
        match &self.rank {
            RankIndex::Compact(vec) => {
                let n = vec.len() as i64;
                if n == 0 {
                    return out;
                }
                let norm = |idx: i64| -> i64 {
                    let idx = if idx < 0 { n + idx } else { idx };
                    idx.clamp(0, n - 1)
                };
                let (s, e) = (norm(start), norm(stop));
                if s > e {
                    return out;
                }
                out.reserve((e - s + 1) as usize);
                for (_, member) in &vec[s as usize..=e as usize] {
                    out.push(member.clone());
                }
            }
            RankIndex::Skiplist(sl) => sl.rank_range(start, stop, &mut out),
        }
        out
    }
}

impl Store {
    fn zset_type_check(&mut self, key: &[u8]) -> Result<(), WrongType> {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        if self.strings.contains_key(key) || self.hashes.contains_key(key) {
            return Err(WrongType);
        }
        Ok(())
    }

    /// Adds a member or updates its score. Returns 1 for a new member,
    /// 0 for an existing one (whose score is moved if it changed).
    pub(super) fn zadd(&mut self, key: &[u8], score: f64, member: Bytes) -> Result<i64, WrongType> {
        self.zset_type_check(key)?;
        let rec = self
            .zsets
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(ZSetRecord::new);

        match rec.scores.get(member.as_ref() as &[u8]).copied() {
            None => {
                rec.rank_insert(score, member.clone());
                rec.scores.insert(member, score);
                Ok(1)
            }
            Some(old) => {
                if old != score {
                    rec.rank_remove(old, &member);
                    rec.rank_insert(score, member.clone());
                    rec.scores.insert(member, score);
                }
                Ok(0)
            }
        }
    }

    /// Removes members, returning how many were present. An emptied
    /// record is deleted along with its TTL entry.
    pub(super) fn zrem(&mut self, key: &[u8], members: &[Bytes]) -> Result<usize, WrongType> {
        self.zset_type_check(key)?;
        let Some(rec) = self.zsets.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            let Some(score) = rec.scores.remove(member.as_ref() as &[u8]) else {
                continue;
            };
            rec.rank_remove(score, member);
            removed += 1;
        }
        if rec.is_empty() {
            self.zsets.remove(key);
            self.drop_expiry(key);
        }
        Ok(removed)
    }

    pub(super) fn zrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<Bytes>, WrongType> {
        self.zset_type_check(key)?;
        Ok(self
            .zsets
            .get(key)
            .map_or_else(Vec::new, |rec| rec.rank_range(start, stop)))
    }

    pub(super) fn zscore(&mut self, key: &[u8], member: &[u8]) -> Result<Option<f64>, WrongType> {
        self.zset_type_check(key)?;
        Ok(self.zsets.get(key).and_then(|rec| rec.score(member)))
    }

    pub(super) fn set_zset_expire_at_ms(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let Some(rec) = self.zsets.get_mut(key) else {
            return false;
        };
        rec.expire_at_ms = expire_at_ms;
        let key = Bytes::copy_from_slice(key);
        self.index_expiry(&key, expire_at_ms);
        true
    }
}
