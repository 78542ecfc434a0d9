//! Zero-knowledge building blocks for compliance attestations.
//!
//! Everything here works over Ristretto255: Pedersen commitments, sigma
//! protocols made non-interactive with a SHA-512 transcript, bit-decomposition
//! range proofs and the compliance proof bundles built from them.

pub mod claim;
pub mod error;
pub mod issuer;
pub mod pedersen;
pub mod proof;
pub mod range;
pub mod sigma;
pub mod transcript;

pub use claim::{ClaimHash, Comparison, Predicate, ProofScheme, ProofType};
pub use error::{ZkError, ZkResult};
pub use issuer::{verify_endorsement, IssuerKey};
pub use pedersen::Generators;
pub use proof::{
    verify_issued_proof, verify_proof, ClaimProver, ClaimRequest, ComplianceProof, ProofBody, ProofBundle,
    VerificationKey,
};
pub use range::RangeProof;
pub use sigma::{DleqProof, SchnorrProof};
pub use transcript::Transcript;
