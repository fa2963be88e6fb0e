//! Trust score error types

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrustError {
    #[error("Invalid trust weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid {field}: {value} is outside [0, 1]")]
    InputOutOfRange { field: &'static str, value: f64 },
}

pub type Result<T> = std::result::Result<T, TrustError>;
