//! The engine facade (§4.6): binds the maplet, a storage backend, and the
//! TTL index behind set/get/delete/exists/expire/ttl/persist/keys/clear/stats.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use maplet::{Maplet, Operator, Value};

use crate::config::{EngineConfig, PersistenceMode};
use crate::error::{EngineError, EngineResult};
use crate::stats::EngineStats;
use crate::storage::{DiskBackend, HybridBackend, MemoryBackend, StorageBackend};
use crate::time::now_millis;
use crate::ttl::TtlIndex;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Sentinel maplet value for engine-layer keys. The engine never relies on
/// the maplet's aggregate semigroup for `get` correctness (§3), so a fixed
/// `Counter` operator over a constant zero is enough to track membership.
fn sentinel() -> Value {
    Value::Scalar(0)
}

pub struct Engine {
    config: EngineConfig,
    maplet: Arc<RwLock<Maplet>>,
    storage: Arc<dyn StorageBackend>,
    ttl: Arc<TtlIndex>,
    state: Arc<AtomicU8>,
    started_at: Instant,
    total_operations: Arc<AtomicU64>,
    storage_operations: Arc<AtomicU64>,
    ttl_cleanups: Arc<AtomicU64>,
    lock_file: Option<File>,
    sweeper_shutdown: Arc<AtomicBool>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    checkpoints: Arc<AtomicU64>,
    checkpoint_shutdown: Arc<AtomicBool>,
    checkpoint_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let lock_file = match config.persistence_mode {
            PersistenceMode::Memory => None,
            _ => {
                let data_dir = config.data_dir.as_ref().expect("validated non-memory mode has data_dir");
                Some(Self::acquire_lock(data_dir)?)
            }
        };

        let sync_interval = Duration::from_millis(config.aof_sync_interval_ms);
        let storage: Arc<dyn StorageBackend> = match config.persistence_mode {
            PersistenceMode::Memory => Arc::new(MemoryBackend::new()),
            PersistenceMode::Disk => {
                let data_dir = config.data_dir.as_ref().expect("validated");
                Arc::new(DiskBackend::open(data_dir)?)
            }
            PersistenceMode::Aof => {
                let data_dir = config.data_dir.as_ref().expect("validated");
                // Unbounded hybrid backend: no eviction, matching §4.4 "aof"
                // rebuilding a full in-memory map from the log on startup.
                Arc::new(HybridBackend::open(data_dir, None, sync_interval)?)
            }
            PersistenceMode::Hybrid => {
                let data_dir = config.data_dir.as_ref().expect("validated");
                Arc::new(HybridBackend::open(data_dir, config.memory_capacity, sync_interval)?)
            }
        };

        let maplet = Maplet::new(config.capacity, config.false_positive_rate, Operator::Counter)?;
        let maplet = Arc::new(RwLock::new(maplet));
        Self::warm_up_maplet(&maplet, &storage)?;

        let ttl = Arc::new(TtlIndex::new());
        let sweeper_shutdown = Arc::new(AtomicBool::new(false));
        let ttl_cleanups = Arc::new(AtomicU64::new(0));

        let sweeper_handle = if config.ttl_enabled {
            Some(Self::spawn_sweeper(
                Duration::from_millis(config.ttl_cleanup_interval_ms),
                Arc::clone(&maplet),
                Arc::clone(&storage),
                Arc::clone(&ttl),
                Arc::clone(&sweeper_shutdown),
                Arc::clone(&ttl_cleanups),
            ))
        } else {
            None
        };

        let checkpoints = Arc::new(AtomicU64::new(0));
        let checkpoint_shutdown = Arc::new(AtomicBool::new(false));
        // Checkpointing only does anything useful for backends with a log
        // to compact; memory/disk modes get the no-op default from the trait.
        let checkpoint_handle = match config.persistence_mode {
            PersistenceMode::Aof | PersistenceMode::Hybrid => Some(Self::spawn_checkpointer(
                Duration::from_millis(config.checkpoint_interval_ms),
                Arc::clone(&storage),
                Arc::clone(&checkpoint_shutdown),
                Arc::clone(&checkpoints),
            )),
            _ => None,
        };

        Ok(Self {
            config,
            maplet,
            storage,
            ttl,
            state: Arc::new(AtomicU8::new(STATE_OPEN)),
            started_at: Instant::now(),
            total_operations: Arc::new(AtomicU64::new(0)),
            storage_operations: Arc::new(AtomicU64::new(0)),
            ttl_cleanups,
            lock_file,
            sweeper_shutdown,
            sweeper_handle: Mutex::new(sweeper_handle),
            checkpoints,
            checkpoint_shutdown,
            checkpoint_handle: Mutex::new(checkpoint_handle),
        })
    }

    fn acquire_lock(data_dir: &Path) -> EngineResult<File> {
        std::fs::create_dir_all(data_dir)?;
        let lock_path = data_dir.join("LOCK");
        let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| EngineError::LockUnavailable)?;
        Ok(file)
    }

    /// Reconstructs maplet membership from the storage backend's keys.
    /// Resolves the "disk-mode maplet warm-up" open question by applying
    /// the recommended choice uniformly to every persistent mode: storage
    /// is authoritative across restarts, the maplet is not.
    fn warm_up_maplet(maplet: &Arc<RwLock<Maplet>>, storage: &Arc<dyn StorageBackend>) -> EngineResult<()> {
        let mut maplet = maplet.write();
        for key in storage.keys()? {
            maplet.insert(&key, sentinel())?;
        }
        Ok(())
    }

    fn spawn_sweeper(
        interval: Duration,
        maplet: Arc<RwLock<Maplet>>,
        storage: Arc<dyn StorageBackend>,
        ttl: Arc<TtlIndex>,
        shutdown: Arc<AtomicBool>,
        cleanups: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                for key in ttl.expired_keys() {
                    if let Err(e) = storage.delete(&key) {
                        log::warn!("ttl sweeper: failed to delete expired key from storage: {e}");
                    }
                    maplet.write().delete(&key);
                    ttl.remove(&key);
                    cleanups.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }

    /// Periodic checkpoint task (§4.4): rewrites the backend's durable log
    /// as a compacted snapshot plus a trailing checkpoint marker, so the
    /// tail-corruption tolerance in AOF replay has a recent truncation
    /// point to fall back to instead of growing the log unboundedly.
    fn spawn_checkpointer(
        interval: Duration,
        storage: Arc<dyn StorageBackend>,
        shutdown: Arc<AtomicBool>,
        checkpoints: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        // Sleeps in short quanta rather than one `sleep(interval)` call, so
        // `close()` doesn't block for up to a full (possibly long) interval
        // waiting for this thread to notice the shutdown flag.
        const POLL: Duration = Duration::from_millis(50);
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let mut waited = Duration::ZERO;
                while waited < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let step = POLL.min(interval - waited);
                    thread::sleep(step);
                    waited += step;
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match storage.checkpoint() {
                    Ok(()) => {
                        checkpoints.fetch_add(1, Ordering::Relaxed);
                        log::debug!("checkpoint: compacted log rewritten");
                    }
                    Err(e) => log::warn!("checkpoint: failed to compact log: {e}"),
                }
            }
        })
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(EngineError::EngineClosed);
        }
        Ok(())
    }

    /// Lazy expiry: if `key` carries a TTL that has passed, remove it from
    /// storage, maplet, and the TTL index, then report it as absent.
    fn lazily_expire(&self, key: &[u8]) {
        if self.ttl.is_expired(key) {
            let _ = self.storage.delete(key);
            self.maplet.write().delete(key);
            self.ttl.remove(key);
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.maplet.write().insert(key, sentinel())?;
        self.storage_operations.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.storage.put(key, value) {
            self.maplet.write().delete(key);
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        if !self.maplet.read().contains(key) {
            return Ok(None);
        }
        self.storage_operations.fetch_add(1, Ordering::Relaxed);
        self.storage.get(key)
    }

    pub fn exists(&self, key: &[u8]) -> EngineResult<bool> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        if !self.maplet.read().contains(key) {
            return Ok(false);
        }
        self.storage_operations.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key)?.is_some())
    }

    pub fn delete(&self, key: &[u8]) -> EngineResult<bool> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        self.storage_operations.fetch_add(1, Ordering::Relaxed);
        let existed = self.storage.delete(key)?;
        if existed {
            self.maplet.write().delete(key);
            self.ttl.remove(key);
        }
        Ok(existed)
    }

    pub fn keys(&self) -> EngineResult<Vec<Vec<u8>>> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.storage_operations.fetch_add(1, Ordering::Relaxed);
        self.storage.keys()
    }

    pub fn clear(&self) -> EngineResult<()> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        for key in self.storage.keys()? {
            self.storage.delete(&key)?;
        }
        *self.maplet.write() = Maplet::new(self.config.capacity, self.config.false_positive_rate, Operator::Counter)?;
        self.ttl.clear();
        Ok(())
    }

    pub fn expire(&self, key: &[u8], seconds: u64) -> EngineResult<bool> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        if !self.exists_without_ttl_bookkeeping(key)? {
            return Ok(false);
        }
        let expiry_ms = self.ttl.expire(key, seconds);
        if let Err(e) = self.storage.record_expiry(key, expiry_ms) {
            self.ttl.persist(key);
            return Err(e);
        }
        Ok(true)
    }

    pub fn ttl(&self, key: &[u8]) -> EngineResult<Option<i64>> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        Ok(self.ttl.ttl(key))
    }

    pub fn persist(&self, key: &[u8]) -> EngineResult<bool> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.lazily_expire(key);
        Ok(self.ttl.persist(key))
    }

    pub fn expire_many(&self, keys: &[Vec<u8>], seconds: u64) -> EngineResult<usize> {
        self.check_open()?;
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        let mut count = 0;
        for key in keys {
            self.lazily_expire(key);
            if self.exists_without_ttl_bookkeeping(key)? {
                let expiry_ms = self.ttl.expire(key, seconds);
                if let Err(e) = self.storage.record_expiry(key, expiry_ms) {
                    self.ttl.persist(key);
                    return Err(e);
                }
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn keys_with_ttl(&self) -> EngineResult<Vec<Vec<u8>>> {
        self.check_open()?;
        Ok(self.ttl.keys_with_ttl())
    }

    fn exists_without_ttl_bookkeeping(&self, key: &[u8]) -> EngineResult<bool> {
        if !self.maplet.read().contains(key) {
            return Ok(false);
        }
        Ok(self.storage.get(key)?.is_some())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime: self.started_at.elapsed(),
            total_operations: self.total_operations.load(Ordering::Relaxed),
            maplet: self.maplet.read().stats(),
            storage_operations: self.storage_operations.load(Ordering::Relaxed),
            storage_memory_bytes: self.storage.memory_usage(),
            ttl_entries: self.ttl.len(),
            ttl_cleanups: self.ttl_cleanups.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.check_open()?;
        self.storage.flush()
    }

    /// Stops the sweeper, flushes, and releases the storage and the
    /// directory lock. Idempotent: closing an already-closed/closing
    /// engine is a no-op. Operations issued after `close()` returns
    /// `EngineClosed` rather than a silent `None` (documented choice, see
    /// DESIGN.md) — a caller writing to a closed engine is a bug worth
    /// surfacing, not masking.
    pub fn close(&mut self) -> EngineResult<()> {
        if self.state.swap(STATE_CLOSING, Ordering::AcqRel) != STATE_OPEN {
            self.state.store(STATE_CLOSED, Ordering::Release);
            return Ok(());
        }
        self.sweeper_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper_handle.lock().take() {
            let _ = handle.join();
        }
        self.checkpoint_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.checkpoint_handle.lock().take() {
            let _ = handle.join();
        }
        self.storage.flush()?;
        self.storage.close()?;
        self.lock_file = None;
        self.state.store(STATE_CLOSED, Ordering::Release);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            let _ = self.close();
        }
    }
}
