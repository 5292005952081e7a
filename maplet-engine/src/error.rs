use thiserror::Error;

use maplet::MapletError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Maplet(#[from] MapletError),
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),
    #[error("corrupted AOF record at offset {offset}: {reason}")]
    CorruptedLog { offset: u64, reason: String },
    #[error("engine is closed")]
    EngineClosed,
    #[error("data directory is locked by another engine instance")]
    LockUnavailable,
}

pub type EngineResult<T> = Result<T, EngineError>;
