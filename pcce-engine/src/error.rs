use pcce_lattice::LatticeError;
use pcce_zk::ZkError;
use thiserror::Error;

use crate::config::ConfigError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine failures. Messages carry ids, hex hashes and counts only; never
/// ciphertext coefficients, keys or shares.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("invalid threshold t={t} n={n}")]
    InvalidThreshold { t: usize, n: usize },
    #[error("context mismatch: expected {expected}, found {found}")]
    ContextMismatch { expected: String, found: String },
    #[error("noise budget exceeded at level {level}, {required} more level(s) required")]
    NoiseBudgetExceeded { level: usize, required: usize },
    #[error("insufficient quorum in round {round}: {received} of {required} responses")]
    InsufficientQuorum {
        received: usize,
        required: usize,
        round: u64,
    },
    #[error("PSI encoding mismatch: {left} vs {right}")]
    PsiEncodingMismatch { left: String, right: String },
    #[error("proof verification failed: {0}")]
    ProofVerificationFailed(String),
    #[error("deletion proof does not verify for ciphertext {ciphertext_hash}")]
    DeletionProofInvalid { ciphertext_hash: String },
    #[error("{stage} timed out in round {round}")]
    Timeout { stage: &'static str, round: u64 },
    #[error("unknown ciphertext handle {0}")]
    UnknownHandle(u64),
    #[error("unknown participant {0}")]
    UnknownParticipant(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker pool failure: {0}")]
    WorkerPool(String),
    #[error(transparent)]
    Lattice(LatticeError),
    #[error(transparent)]
    Zk(ZkError),
}

impl EngineError {
    /// Quorum and deadline failures may succeed when re-solicited; everything
    /// else fails identically on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientQuorum { .. } | EngineError::Timeout { .. }
        )
    }
}

impl From<LatticeError> for EngineError {
    fn from(err: LatticeError) -> Self {
        match err {
            LatticeError::InvalidParameters(reason) => EngineError::InvalidParameters(reason),
            LatticeError::ContextMismatch { expected, found } => {
                EngineError::ContextMismatch { expected, found }
            }
            LatticeError::LevelExhausted { level, required } => {
                EngineError::NoiseBudgetExceeded { level, required }
            }
            LatticeError::MissingRotationKey(steps) => {
                EngineError::InvalidParameters(format!("no rotation key for {steps} step(s)"))
            }
            other => EngineError::Lattice(other),
        }
    }
}

impl From<ZkError> for EngineError {
    fn from(err: ZkError) -> Self {
        match err {
            ZkError::UnsupportedScheme(name) => {
                EngineError::InvalidParameters(format!("unsupported proof scheme `{name}`"))
            }
            ZkError::InvalidParameters(reason) => EngineError::InvalidParameters(reason),
            other => EngineError::Zk(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_quorum_and_timeouts_are_retryable() {
        assert!(EngineError::InsufficientQuorum {
            received: 2,
            required: 3,
            round: 1
        }
        .is_retryable());
        assert!(EngineError::Timeout {
            stage: "collecting",
            round: 1
        }
        .is_retryable());
        assert!(!EngineError::InvalidThreshold { t: 4, n: 3 }.is_retryable());
        assert!(!EngineError::NoiseBudgetExceeded {
            level: 0,
            required: 1
        }
        .is_retryable());
    }

    #[test]
    fn lattice_errors_map_onto_the_taxonomy() {
        let err: EngineError = LatticeError::LevelExhausted {
            level: 0,
            required: 1,
        }
        .into();
        assert!(matches!(err, EngineError::NoiseBudgetExceeded { level: 0, required: 1 }));
        let err: EngineError = ZkError::UnsupportedScheme("zk-snark".into()).into();
        assert!(matches!(err, EngineError::InvalidParameters(_)));
    }
}
