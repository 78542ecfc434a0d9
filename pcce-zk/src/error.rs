use thiserror::Error;

pub type ZkResult<T> = Result<T, ZkError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("unsupported proof scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("malformed claim: {0}")]
    MalformedClaim(String),
    #[error("witness does not satisfy the claimed predicate")]
    PredicateUnsatisfied,
    #[error("value outside the {bits}-bit proof range")]
    OutOfRange { bits: u32 },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("invalid point or scalar encoding: {0}")]
    Encoding(&'static str),
}
