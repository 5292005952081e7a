//! In-RAM backend: no durability, just an ordered map behind a read-write
//! lock (the pack's `parking_lot` lock-of-choice, per parity-db/skytable).

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::EngineResult;
use crate::storage::StorageBackend;

#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> EngineResult<bool> {
        Ok(self.map.write().remove(key).is_some())
    }

    fn keys(&self) -> EngineResult<Vec<Vec<u8>>> {
        Ok(self.map.read().keys().cloned().collect())
    }

    fn flush(&self) -> EngineResult<()> {
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        self.map.read().iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put(b"k", b"v").unwrap();
        assert_eq!(backend.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(backend.delete(b"k").unwrap());
        assert_eq!(backend.get(b"k").unwrap(), None);
        assert!(!backend.delete(b"k").unwrap());
    }

    #[test]
    fn keys_lists_all_live_entries() {
        let backend = MemoryBackend::new();
        backend.put(b"a", b"1").unwrap();
        backend.put(b"b", b"2").unwrap();
        let mut keys = backend.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
