//! Privacy-preserving compliance computation.
//!
//! Compliance metrics, risk scores and audit claims are aggregated, compared
//! and proven while they stay encrypted. The crate layers the protocols on
//! top of the `pcce-lattice` arithmetic leaf and the `pcce-zk` proof
//! primitives:
//!
//! - [`context`] owns parameters and key material;
//! - [`arithmetic`] evaluates over opaque [`CiphertextHandle`]s held in a [`CiphertextVault`];
//! - [`audit`] runs threshold multi-party rounds over injected participants;
//! - [`psi`], [`comparison`] and [`proofs`] reveal only counts, bits and proofs;
//! - [`deletion`] certifies that evidence was discarded.
//!
//! [`ComplianceEngine`] wires all of it from an [`EngineConfig`].

pub mod arithmetic;
pub mod audit;
pub mod benchmark;
pub mod comparison;
pub mod config;
pub mod context;
pub mod deletion;
pub mod error;
pub mod policy;
pub mod pool;
pub mod proofs;
pub mod psi;
pub mod refresh;
pub mod scoring;
pub mod service;
pub mod vault;
pub mod wire;

pub use crate::arithmetic::{AggregationMetadata, AggregationMode, HomomorphicEngine};
pub use crate::audit::{
    AuditAggregation, AuditParticipant, AuditResult, AuditSettings, AuditState, AuditVerdict,
    InMemoryParticipantRegistry, LocalParticipant, ParticipantClient, ParticipantRegistry, ThresholdAudit,
};
pub use crate::benchmark::{Benchmark, BenchmarkPosition};
pub use crate::comparison::{
    ComparisonOp, ComparisonOutcome, DecryptionOracle, KeyHolderOracle, Operand, SecureComparator,
    SignAttestation, ThresholdOracle,
};
pub use crate::config::{load_config, ConfigError, ConfigFormat, EngineConfig};
pub use crate::context::{ContextManager, KeyMaterial, PublicMaterial, ThresholdKeyMaterial};
pub use crate::deletion::{DeletionCertificate, DeletionRegistry};
pub use crate::error::{EngineError, EngineResult};
pub use crate::policy::{Classification, Direction, PolicyThresholdTable, Severity};
pub use crate::pool::WorkerPool;
pub use crate::proofs::ProofService;
pub use crate::psi::{EncodedElement, EncodingScheme, PrivateSetIntersection, PsiOutcome, RevealMode};
pub use crate::refresh::{KeyHolderRefresher, RefreshPolicy, Refresher};
pub use crate::scoring::{ComplianceMetric, ComplianceScorer, EncryptedScore};
pub use crate::service::ComplianceEngine;
pub use crate::vault::{CiphertextHandle, CiphertextVault};
pub use crate::wire::{BlobKind, WireBlob};
