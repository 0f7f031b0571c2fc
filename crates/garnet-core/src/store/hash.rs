//! Hash record operations.

use super::*;

impl Store {
    fn hash_type_check(&mut self, key: &[u8]) -> Result<(), WrongType> {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        if self.strings.contains_key(key) || self.zsets.contains_key(key) {
            return Err(WrongType);
        }
        Ok(())
    }

    /// Sets one field. Returns 1 when the field is newly added, 0 when
    /// an existing field's value was replaced. Creates the hash record
    /// on first write.
    pub(super) fn hset(&mut self, key: &[u8], field: Bytes, value: Bytes) -> Result<i64, WrongType> {
        self.hash_type_check(key)?;
        let rec = self
            .hashes
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| HashRecord {
                fields: HashMap::new(),
                expire_at_ms: time::NO_EXPIRY,
            });
        let added = i64::from(!rec.fields.contains_key(field.as_ref() as &[u8]));
        rec.fields.insert(field, value);
        Ok(added)
    }

    pub(super) fn hget(&mut self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.hash_type_check(key)?;
        Ok(self
            .hashes
            .get(key)
            .and_then(|rec| rec.fields.get(field))
            .cloned())
    }

    /// Deletes fields, returning how many were present. Removing the
    /// last field removes the hash record itself (and its TTL entry).
    pub(super) fn hdel(&mut self, key: &[u8], fields: &[Bytes]) -> Result<usize, WrongType> {
        self.hash_type_check(key)?;
        let Some(rec) = self.hashes.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            if rec.fields.remove(field.as_ref() as &[u8]).is_some() {
                removed += 1;
            }
        }
        if rec.fields.is_empty() {
            self.hashes.remove(key);
            self.drop_expiry(key);
        }
        Ok(removed)
    }

    pub(super) fn hexists(&mut self, key: &[u8], field: &[u8]) -> Result<bool, WrongType> {
        self.hash_type_check(key)?;
        Ok(self
            .hashes
            .get(key)
            .is_some_and(|rec| rec.fields.contains_key(field)))
    }

    /// Returns `[field, value, field, value, ...]` with no defined
    /// field ordering.
    pub(super) fn hgetall_flat(&mut self, key: &[u8]) -> Result<Vec<Bytes>, WrongType> {
        self.hash_type_check(key)?;
        let Some(rec) = self.hashes.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(rec.fields.len() * 2);
        for (field, value) in &rec.fields {
            out.push(field.clone());
            out.push(value.clone());
        }
        Ok(out)
    }

    pub(super) fn hlen(&mut self, key: &[u8]) -> Result<usize, WrongType> {
        self.hash_type_check(key)?;
        Ok(self.hashes.get(key).map_or(0, |rec| rec.fields.len()))
    }

    /// Restore-path deadline setter; returns false if no hash record
    /// exists for the key.
    pub(super) fn set_hash_expire_at_ms(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let Some(rec) = self.hashes.get_mut(key) else {
            return false;
        };
        rec.expire_at_ms = expire_at_ms;
        let key = Bytes::copy_from_slice(key);
        self.index_expiry(&key, expire_at_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now_ms;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn hset_reports_new_vs_updated() {
        let engine = Engine::new();
        assert_eq!(engine.hset(b"h", b("f"), b("one")).unwrap(), 1);
        assert_eq!(engine.hset(b"h", b("f"), b("two")).unwrap(), 0);
        assert_eq!(engine.hget(b"h", b"f").unwrap(), Some(b("two")));
    }

    #[test]
    fn hget_missing() {
        let engine = Engine::new();
        assert_eq!(engine.hget(b"nope", b"f").unwrap(), None);
        engine.hset(b"h", b("f"), b("v")).unwrap();
        assert_eq!(engine.hget(b"h", b"other").unwrap(), None);
    }

    #[test]
    fn hdel_counts_and_removes_empty_record() {
        let engine = Engine::new();
        engine.hset(b"h", b("f1"), b("v1")).unwrap();
        engine.hset(b"h", b("f2"), b("v2")).unwrap();

        let removed = engine
            .hdel(b"h", &[b("f1"), b("ghost"), b("f2")])
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!engine.exists(b"h"));
    }

    #[test]
    fn hdel_on_missing_key() {
        let engine = Engine::new();
        assert_eq!(engine.hdel(b"nope", &[b("f")]).unwrap(), 0);
    }

    #[test]
    fn emptied_hash_drops_its_ttl_entry() {
        let engine = Engine::new();
        engine.hset(b"h", b("f"), b("v")).unwrap();
        engine.set_hash_expire_at_ms(b"h", now_ms() + 60_000);
        assert_eq!(engine.expiring_key_count(), 1);

        engine.hdel(b"h", &[b("f")]).unwrap();
        assert_eq!(engine.expiring_key_count(), 0);
    }

    #[test]
    fn hexists_and_hlen() {
        let engine = Engine::new();
        engine.hset(b"h", b("a"), b("1")).unwrap();
        engine.hset(b"h", b("b"), b("2")).unwrap();

        assert!(engine.hexists(b"h", b"a").unwrap());
        assert!(!engine.hexists(b"h", b"z").unwrap());
        assert_eq!(engine.hlen(b"h").unwrap(), 2);
        assert_eq!(engine.hlen(b"missing").unwrap(), 0);
    }

    #[test]
    fn hgetall_flat_pairs_up() {
        let engine = Engine::new();
        engine.hset(b"h", b("a"), b("1")).unwrap();
        engine.hset(b"h", b("b"), b("2")).unwrap();

        let flat = engine.hgetall_flat(b"h").unwrap();
        assert_eq!(flat.len(), 4);
        // ordering is unspecified; check the pairs instead
        let pairs: std::collections::HashMap<_, _> = flat
            .chunks(2)
            .map(|c| (c[0].clone(), c[1].clone()))
            .collect();
        assert_eq!(pairs.get(&b("a")), Some(&b("1")));
        assert_eq!(pairs.get(&b("b")), Some(&b("2")));
    }

    #[test]
    fn hash_ops_on_string_key_are_wrong_type() {
        let engine = Engine::new();
        engine.set(b"s", b("v"), None).unwrap();
        assert_eq!(engine.hset(b"s", b("f"), b("v")), Err(WrongType));
        assert_eq!(engine.hget(b"s", b"f"), Err(WrongType));
        assert_eq!(engine.hdel(b"s", &[b("f")]), Err(WrongType));
        assert_eq!(engine.hexists(b"s", b"f"), Err(WrongType));
        assert_eq!(engine.hgetall_flat(b"s"), Err(WrongType));
        assert_eq!(engine.hlen(b"s"), Err(WrongType));
    }

    #[test]
    fn expired_hash_is_recreated_fresh() {
        let engine = Engine::new();
        engine.hset(b"h", b("old"), b("v")).unwrap();
        engine.set_hash_expire_at_ms(b"h", now_ms() - 1);

        // the expired record is evicted on touch; this write starts over
        assert_eq!(engine.hset(b"h", b("new"), b("v")).unwrap(), 1);
        assert_eq!(engine.hlen(b"h").unwrap(), 1);
        assert_eq!(engine.hget(b"h", b"old").unwrap(), None);
    }
}
