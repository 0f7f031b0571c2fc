//! String record operations.

use super::*;

impl Store {
    /// Stores a string, overwriting any existing string record. With no
    /// TTL the key's expiration is cleared; with one it becomes
    /// `now + ttl_ms`. Fails if the key holds a hash or sorted set.
    pub(super) fn set(
        &mut self,
        key: &[u8],
        value: Bytes,
        ttl_ms: Option<i64>,
    ) -> Result<(), WrongType> {
        let now = time::now_ms();
        let expire_at_ms = match ttl_ms {
            Some(ttl) => now + ttl,
            None => time::NO_EXPIRY,
        };
        self.set_with_expire_at_ms(key, value, expire_at_ms)
    }

    /// Stores a string with an absolute deadline (`< 0` = none). The
    /// restore path for RDB load and replica sync.
    pub(super) fn set_with_expire_at_ms(
        &mut self,
        key: &[u8],
        value: Bytes,
        expire_at_ms: i64,
    ) -> Result<(), WrongType> {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        if self.hashes.contains_key(key) || self.zsets.contains_key(key) {
            return Err(WrongType);
        }
        let key = Bytes::copy_from_slice(key);
        self.strings
            .insert(key.clone(), StringRecord { value, expire_at_ms });
        self.index_expiry(&key, expire_at_ms);
        Ok(())
    }

    pub(super) fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        let now = time::now_ms();
        self.expire_any_if_due(key, now);
        if self.hashes.contains_key(key) || self.zsets.contains_key(key) {
            return Err(WrongType);
        }
        Ok(self.strings.get(key).map(|r| r.value.clone()))
    }

    /// Sets or clears a relative TTL on a string record. `ttl < 0`
    /// clears it. Returns false if no string record exists — hash and
    /// sorted-set deadlines go through their dedicated setters.
    pub(super) fn expire(&mut self, key: &[u8], ttl_seconds: i64) -> bool {
        let now = time::now_ms();
        self.expire_string_if_due(key, now);
        let Some(rec) = self.strings.get_mut(key) else {
            return false;
        };
        if ttl_seconds < 0 {
            rec.expire_at_ms = time::NO_EXPIRY;
            self.drop_expiry(key);
            return true;
        }
        let deadline = now + ttl_seconds * 1000;
        rec.expire_at_ms = deadline;
        let key = Bytes::copy_from_slice(key);
        self.index_expiry(&key, deadline);
        true
    }

    /// Remaining TTL in whole seconds; `-1` for a string without one,
    /// `-2` when the key is missing (or expired on the way in).
    pub(super) fn ttl(&mut self, key: &[u8]) -> i64 {
        let now = time::now_ms();
        self.expire_string_if_due(key, now);
        let Some(rec) = self.strings.get(key) else {
            return -2;
        };
        if rec.expire_at_ms < 0 {
            return -1;
        }
        let ms_left = rec.expire_at_ms - now;
        if ms_left <= 0 {
            return -2;
        }
        ms_left / 1000
    }

    pub(super) fn set_string_expire_at_ms(&mut self, key: &[u8], expire_at_ms: i64) -> bool {
        let Some(rec) = self.strings.get_mut(key) else {
            return false;
        };
        rec.expire_at_ms = expire_at_ms;
        let key = Bytes::copy_from_slice(key);
        self.index_expiry(&key, expire_at_ms);
        true
    }
}
