//! Embedded ordered key-value tree: an append-only record log on disk plus
//! an in-memory `BTreeMap` index rebuilt at open. Grounded on parity-db's
//! `ValueTable` (positional I/O, header/metadata recovery on open,
//! `sync_data`-backed flush) but simplified to a single growable file with
//! a plain index instead of parity-db's size-tiered multi-file layout and
//! free-list reuse.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::EngineResult;
use crate::storage::StorageBackend;

const TOMBSTONE: u8 = 0;
const LIVE: u8 = 1;

pub struct DiskBackend {
    file: Mutex<File>,
    index: RwLock<BTreeMap<Vec<u8>, u64>>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl DiskBackend {
    pub fn open(data_dir: &Path) -> EngineResult<Self> {
        let tree_dir = data_dir.join("tree");
        std::fs::create_dir_all(&tree_dir)?;
        let path = tree_dir.join("data.log");
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        let index = Self::rebuild_index(&mut file)?;
        Ok(Self { file: Mutex::new(file), index: RwLock::new(index), path })
    }

    fn rebuild_index(file: &mut File) -> EngineResult<BTreeMap<Vec<u8>, u64>> {
        let mut index = BTreeMap::new();
        file.seek(SeekFrom::Start(0))?;
        loop {
            let record_start = match file.stream_position() {
                Ok(p) => p,
                Err(_) => break,
            };
            let mut tag = [0u8; 1];
            if file.read_exact(&mut tag).is_err() {
                break;
            }
            let mut key_len_buf = [0u8; 4];
            if file.read_exact(&mut key_len_buf).is_err() {
                break;
            }
            let key_len = u32::from_le_bytes(key_len_buf) as usize;
            let mut key = vec![0u8; key_len];
            if file.read_exact(&mut key).is_err() {
                break;
            }
            if tag[0] == LIVE {
                let mut value_len_buf = [0u8; 4];
                if file.read_exact(&mut value_len_buf).is_err() {
                    break;
                }
                let value_len = u32::from_le_bytes(value_len_buf) as usize;
                if file.seek(SeekFrom::Current(value_len as i64)).is_err() {
                    break;
                }
                index.insert(key, record_start);
            } else {
                index.remove(&key);
            }
        }
        Ok(index)
    }

    fn read_record_value(file: &mut File, offset: u64) -> EngineResult<Option<Vec<u8>>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut tag = [0u8; 1];
        file.read_exact(&mut tag)?;
        let mut key_len_buf = [0u8; 4];
        file.read_exact(&mut key_len_buf)?;
        let key_len = u32::from_le_bytes(key_len_buf) as usize;
        file.seek(SeekFrom::Current(key_len as i64))?;
        if tag[0] != LIVE {
            return Ok(None);
        }
        let mut value_len_buf = [0u8; 4];
        file.read_exact(&mut value_len_buf)?;
        let value_len = u32::from_le_bytes(value_len_buf) as usize;
        let mut value = vec![0u8; value_len];
        file.read_exact(&mut value)?;
        Ok(Some(value))
    }
}

impl StorageBackend for DiskBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&[LIVE])?;
        file.write_all(&(key.len() as u32).to_le_bytes())?;
        file.write_all(key)?;
        file.write_all(&(value.len() as u32).to_le_bytes())?;
        file.write_all(value)?;
        drop(file);
        self.index.write().insert(key.to_vec(), offset);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let offset = match self.index.read().get(key) {
            Some(o) => *o,
            None => return Ok(None),
        };
        let mut file = self.file.lock();
        Self::read_record_value(&mut file, offset)
    }

    fn delete(&self, key: &[u8]) -> EngineResult<bool> {
        let existed = self.index.read().contains_key(key);
        if existed {
            let mut file = self.file.lock();
            file.seek(SeekFrom::End(0))?;
            file.write_all(&[TOMBSTONE])?;
            file.write_all(&(key.len() as u32).to_le_bytes())?;
            file.write_all(key)?;
            drop(file);
            self.index.write().remove(key);
        }
        Ok(existed)
    }

    fn keys(&self) -> EngineResult<Vec<Vec<u8>>> {
        Ok(self.index.read().keys().cloned().collect())
    }

    fn flush(&self) -> EngineResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        self.index.read().keys().map(|k| k.len() + 8).sum()
    }

    fn close(&self) -> EngineResult<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_delete_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = DiskBackend::open(dir.path()).unwrap();
            backend.put(b"k1", b"v1").unwrap();
            backend.put(b"k2", b"v2").unwrap();
            backend.delete(b"k2").unwrap();
            backend.flush().unwrap();
        }
        let reopened = DiskBackend::open(dir.path()).unwrap();
        assert_eq!(reopened.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(reopened.get(b"k2").unwrap(), None);
    }

    #[test]
    fn put_overwrite_returns_latest_value() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        backend.put(b"k", b"v1").unwrap();
        backend.put(b"k", b"v2").unwrap();
        assert_eq!(backend.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }
}
