use thiserror::Error;

pub type LatticeResult<T> = Result<T, LatticeError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LatticeError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("no NTT-friendly prime of {bits} bits left for ring dimension {ring_dimension}")]
    PrimeSearchExhausted { bits: u32, ring_dimension: usize },
    #[error("context mismatch: expected {expected}, found {found}")]
    ContextMismatch { expected: String, found: String },
    #[error("noise budget exhausted at level {level}, operation requires {required}")]
    LevelExhausted { level: usize, required: usize },
    #[error("ciphertext has {0} components, expected 2")]
    ComponentCount(usize),
    #[error("missing rotation key for step {0}")]
    MissingRotationKey(usize),
    #[error("threshold error: {0}")]
    Threshold(String),
    #[error("malformed encoding: {0}")]
    Encoding(&'static str),
}
