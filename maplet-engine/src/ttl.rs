//! TTL index: expiry-ordered map plus a reverse key→expiry map (§4.5).
//! Pure data structure — the background sweeper and its cross-cutting
//! access to storage/maplet live on the engine facade (`engine.rs`), since
//! a full sweep tick needs all three components together.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::time::now_millis;

#[derive(Default)]
pub struct TtlIndex {
    expiry_to_keys: Mutex<BTreeMap<i64, HashSet<Vec<u8>>>>,
    key_to_expiry: Mutex<HashMap<Vec<u8>, i64>>,
}

impl TtlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`'s expiry to `now + seconds`, replacing any prior TTL.
    /// Returns the computed absolute expiry timestamp so callers can
    /// journal it (§6.1 Expire record).
    pub fn expire(&self, key: &[u8], seconds: u64) -> i64 {
        let expiry_ms = now_millis() + (seconds as i64) * 1000;
        self.remove_from_expiry_map(key);
        self.key_to_expiry.lock().insert(key.to_vec(), expiry_ms);
        self.expiry_to_keys.lock().entry(expiry_ms).or_default().insert(key.to_vec());
        expiry_ms
    }

    /// Clears any TTL on `key`. Returns whether one was set.
    pub fn persist(&self, key: &[u8]) -> bool {
        let had = self.key_to_expiry.lock().remove(key).is_some();
        if had {
            self.remove_from_expiry_map(key);
        }
        had
    }

    fn remove_from_expiry_map(&self, key: &[u8]) {
        if let Some(expiry_ms) = self.key_to_expiry.lock().get(key).copied() {
            let mut expiry_to_keys = self.expiry_to_keys.lock();
            if let Some(set) = expiry_to_keys.get_mut(&expiry_ms) {
                set.remove(key);
                if set.is_empty() {
                    expiry_to_keys.remove(&expiry_ms);
                }
            }
        }
    }

    /// Remaining seconds until expiry, or `None` if `key` carries no TTL.
    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        let expiry_ms = *self.key_to_expiry.lock().get(key)?;
        let remaining_ms = expiry_ms - now_millis();
        Some((remaining_ms as f64 / 1000.0).ceil() as i64)
    }

    /// True if `key` carries a TTL that has already passed.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        match self.key_to_expiry.lock().get(key) {
            Some(expiry_ms) => *expiry_ms <= now_millis(),
            None => false,
        }
    }

    /// Removes `key` from both TTL maps, if present. Called on lazy expiry
    /// and by the sweeper; does not touch storage/maplet.
    pub fn remove(&self, key: &[u8]) {
        self.remove_from_expiry_map(key);
        self.key_to_expiry.lock().remove(key);
    }

    pub fn keys_with_ttl(&self) -> Vec<Vec<u8>> {
        self.key_to_expiry.lock().keys().cloned().collect()
    }

    /// Keys whose expiry is `<= now`, for the sweeper to act on.
    pub fn expired_keys(&self) -> Vec<Vec<u8>> {
        let now = now_millis();
        let expiry_to_keys = self.expiry_to_keys.lock();
        expiry_to_keys
            .range(..=now)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.key_to_expiry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.key_to_expiry.lock().clear();
        self.expiry_to_keys.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_then_ttl_reports_remaining_seconds() {
        let index = TtlIndex::new();
        index.expire(b"x", 10);
        let remaining = index.ttl(b"x").unwrap();
        assert!((9..=10).contains(&remaining), "remaining={remaining}");
    }

    #[test]
    fn persist_clears_ttl() {
        let index = TtlIndex::new();
        index.expire(b"x", 10);
        assert!(index.persist(b"x"));
        assert_eq!(index.ttl(b"x"), None);
        assert!(!index.persist(b"x"));
    }

    #[test]
    fn expired_keys_appear_after_deadline() {
        let index = TtlIndex::new();
        index.expire(b"x", 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(index.is_expired(b"x"));
        assert_eq!(index.expired_keys(), vec![b"x".to_vec()]);
    }

    #[test]
    fn keys_with_ttl_reflects_current_set() {
        let index = TtlIndex::new();
        index.expire(b"a", 5);
        index.expire(b"b", 5);
        let mut keys = index.keys_with_ttl();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
