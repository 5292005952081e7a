//! Engine configuration. Defaults match spec §4.6/§6.4; `EngineConfig` can
//! be constructed programmatically or loaded from YAML via `serde`.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    Memory,
    Disk,
    Aof,
    Hybrid,
}

impl Default for PersistenceMode {
    fn default() -> Self {
        PersistenceMode::Hybrid
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capacity: usize,
    pub false_positive_rate: f64,
    pub persistence_mode: PersistenceMode,
    pub data_dir: Option<PathBuf>,
    pub memory_capacity: Option<usize>,
    pub aof_sync_interval_ms: u64,
    pub ttl_enabled: bool,
    pub ttl_cleanup_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            false_positive_rate: 0.01,
            persistence_mode: PersistenceMode::Hybrid,
            data_dir: None,
            memory_capacity: None,
            aof_sync_interval_ms: 1000,
            ttl_enabled: true,
            ttl_cleanup_interval_ms: 1000,
            checkpoint_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(contents: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(contents)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.capacity == 0 {
            return Err(EngineError::InvalidConfig("capacity must be positive".into()));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(EngineError::InvalidConfig(
                "false_positive_rate must be in (0, 1)".into(),
            ));
        }
        if self.persistence_mode != PersistenceMode::Memory && self.data_dir.is_none() {
            return Err(EngineError::InvalidConfig(
                "data_dir is required for non-memory persistence modes".into(),
            ));
        }
        if self.aof_sync_interval_ms == 0
            || self.ttl_cleanup_interval_ms == 0
            || self.checkpoint_interval_ms == 0
        {
            return Err(EngineError::InvalidConfig(
                "interval settings must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.capacity, 10_000);
        assert_eq!(cfg.false_positive_rate, 0.01);
        assert_eq!(cfg.persistence_mode, PersistenceMode::Hybrid);
        assert!(cfg.ttl_enabled);
        assert_eq!(cfg.aof_sync_interval_ms, 1000);
        assert_eq!(cfg.ttl_cleanup_interval_ms, 1000);
        assert_eq!(cfg.checkpoint_interval_ms, 60_000);
    }

    #[test]
    fn zero_checkpoint_interval_is_rejected() {
        let cfg = EngineConfig { checkpoint_interval_ms: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn memory_mode_does_not_require_data_dir() {
        let cfg = EngineConfig { persistence_mode: PersistenceMode::Memory, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn disk_mode_requires_data_dir() {
        let cfg = EngineConfig { persistence_mode: PersistenceMode::Disk, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_yaml_parses_partial_overrides() {
        let cfg = EngineConfig::from_yaml("capacity: 500\npersistence_mode: memory\n").unwrap();
        assert_eq!(cfg.capacity, 500);
        assert_eq!(cfg.persistence_mode, PersistenceMode::Memory);
        assert_eq!(cfg.false_positive_rate, 0.01);
    }
}
