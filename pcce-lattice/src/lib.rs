//! RLWE arithmetic backend for the compliance computation engine.
//!
//! Implements approximate (CKKS-style) homomorphic arithmetic over real slot
//! vectors in an RNS representation: a 60-bit base prime, one rescaling prime
//! per level of multiplicative depth and a 61-bit special prime for key
//! switching. The crate is deliberately protocol-agnostic; audits, proofs and
//! policy live in `pcce-engine`, which treats this crate as a swappable leaf.

pub mod arith;
pub mod ciphertext;
pub mod context;
pub mod error;
pub mod eval;
pub mod keys;
pub mod ntt;
pub mod poly;
pub mod sampling;
pub mod threshold;

pub use ciphertext::{decrypt, encrypt, encrypt_at, Ciphertext};
pub use context::{CkksContext, CkksParameters, ContextId};
pub use error::{LatticeError, LatticeResult};
pub use eval::{power_of_two_steps, scales_match, Evaluator};
pub use keys::{KeyGenerator, KeySet, PublicKey, RelinearizationKey, RotationKeys, SecretKey};
pub use poly::RnsPoly;
pub use threshold::{
    ciphertext_digest, combine, lagrange_at_zero, partial_decrypt, KeyShare, PartialDecryption,
    ThresholdDealer, ThresholdKeySet, ThresholdPolicy,
};
