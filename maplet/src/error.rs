use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapletError {
    #[error("table is full and resize is disabled")]
    CapacityExceeded,
    #[error("operator merge failed: {0}")]
    OperatorError(String),
    #[error("quotient size must leave at least one remainder bit")]
    InvalidQuotientSize,
}

pub type MapletResult<T> = Result<T, MapletError>;
