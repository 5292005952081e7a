//! Engine-level statistics: composes maplet stats with storage and TTL
//! counters plus process uptime.

use std::time::Duration;

use maplet::MapletStats;

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub uptime: Duration,
    pub total_operations: u64,
    pub maplet: MapletStats,
    pub storage_operations: u64,
    pub storage_memory_bytes: usize,
    pub ttl_entries: usize,
    pub ttl_cleanups: u64,
    pub checkpoints: u64,
}
