//! Secure comparison of encrypted values.
//!
//! The engine computes the encrypted difference, shifts it by the tolerance
//! band and multiplies it by a fresh random integer blind. Only the blinded
//! value reaches a [`DecryptionOracle`], which reveals nothing but its sign
//! and attests that sign with a Pedersen commitment plus a zero-knowledge
//! proof. Because blinding is an exact integer product the ciphertext scale
//! is untouched, so neither the blind nor the tolerance is visible to the
//! oracle.
//!
//! The sign is read from the decrypted value itself, never from its
//! fixed-point rounding: a positive blind preserves the sign exactly, so
//! repeating a comparison on the same ciphertexts yields the same bit even
//! when the difference sits just past the tolerance band.

use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use parking_lot::Mutex;
use pcce_lattice::{
    ciphertext_digest, combine, decrypt, partial_decrypt, Ciphertext, CkksContext, KeyShare,
    SecretKey, ThresholdPolicy,
};
use pcce_telemetry::names;
use pcce_zk::pedersen::{decode_point, encode_point, random_scalar};
use pcce_zk::{Generators, RangeProof, SchnorrProof, Transcript};
use rand::rngs::OsRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arithmetic::HomomorphicEngine;
use crate::context::ensure_context;
use crate::error::{EngineError, EngineResult};
use crate::vault::CiphertextHandle;

const ATTESTATION_DOMAIN: &[u8] = b"pcce/sign-attestation/v1";
const BLIND_BITS: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonOp {
    Greater,
    Less,
    Equal,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Greater => "greater",
            ComparisonOp::Less => "less",
            ComparisonOp::Equal => "equal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sign {
    Negative,
    Zero,
    Positive,
}

impl Sign {
    fn tag(self) -> u64 {
        match self {
            Sign::Negative => 0,
            Sign::Zero => 1,
            Sign::Positive => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignEvidence {
    /// `C - G` commits to a value in `[0, 2^bits)`, so `|v| >= 1`.
    NonZero(RangeProof),
    /// `C = r·H`, so the committed magnitude is zero.
    Zero(SchnorrProof),
}

/// An oracle's signed statement about one blinded ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignAttestation {
    pub sign: Sign,
    /// Binds the attestation to the blinded ciphertext and the query.
    pub statement: [u8; 32],
    /// Commitment to the fixed-point magnitude of the blinded value, at
    /// least one unless the value is exactly zero.
    pub commitment: [u8; 32],
    pub evidence: SignEvidence,
}

fn attestation_transcript(statement: &[u8; 32], sign: Sign, commitment: &[u8; 32]) -> Transcript {
    let mut transcript = Transcript::new(ATTESTATION_DOMAIN);
    transcript.append(b"statement", statement);
    transcript.append_u64(b"sign", sign.tag());
    transcript.append(b"commitment", commitment);
    transcript
}

impl SignAttestation {
    fn issue(
        value: f64,
        statement: [u8; 32],
        fixed_point_scale: u32,
        range_bits: u32,
    ) -> EngineResult<Self> {
        let scaled = (value.abs() * fixed_point_scale as f64).round();
        if !scaled.is_finite() || scaled >= 2f64.powi(range_bits as i32) {
            return Err(EngineError::InvalidParameters(
                "blinded difference outside the attestation range".into(),
            ));
        }
        let sign = if value > 0.0 {
            Sign::Positive
        } else if value < 0.0 {
            Sign::Negative
        } else {
            Sign::Zero
        };
        let magnitude = match sign {
            Sign::Zero => 0,
            Sign::Positive | Sign::Negative => (scaled as u64).max(1),
        };
        let gens = Generators::default();
        let mut rng = OsRng;
        let blinding = random_scalar(&mut rng);
        let commitment = gens.commit(Scalar::from(magnitude), blinding);
        let encoded = encode_point(&commitment);
        let mut transcript = attestation_transcript(&statement, sign, &encoded);
        let evidence = if magnitude == 0 {
            SignEvidence::Zero(SchnorrProof::prove(&mut transcript, &gens.h, &commitment, blinding, &mut rng))
        } else {
            SignEvidence::NonZero(RangeProof::prove(
                &gens,
                &mut transcript,
                magnitude - 1,
                blinding,
                range_bits,
                &mut rng,
            )?)
        };
        Ok(Self {
            sign,
            statement,
            commitment: encoded,
            evidence,
        })
    }

    pub fn verify(&self) -> bool {
        let Ok(commitment) = decode_point(&self.commitment) else {
            return false;
        };
        let gens = Generators::default();
        let mut transcript = attestation_transcript(&self.statement, self.sign, &self.commitment);
        match (&self.evidence, self.sign) {
            (SignEvidence::Zero(proof), Sign::Zero) => proof.verify(&mut transcript, &gens.h, &commitment),
            (SignEvidence::NonZero(range), Sign::Positive | Sign::Negative) => {
                let shifted: RistrettoPoint = commitment - gens.g;
                range.verify(&gens, &mut transcript, &shifted)
            }
            _ => false,
        }
    }
}

/// Parameters an oracle uses when attesting a sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttestationParams {
    pub fixed_point_scale: u32,
    pub range_bits: u32,
}

impl Default for AttestationParams {
    fn default() -> Self {
        Self {
            fixed_point_scale: 100,
            range_bits: 32,
        }
    }
}

/// Whoever holds enough key material to decrypt. Implementations decrypt
/// inside their own boundary; only signs, attestations and proof witnesses
/// for their own claims leave it.
pub trait DecryptionOracle: Send + Sync {
    /// Slot 0 of `ct`.
    fn decrypt_slot(&self, ct: &Ciphertext) -> EngineResult<f64>;

    fn attest_sign(
        &self,
        ct: &Ciphertext,
        statement: [u8; 32],
        params: AttestationParams,
    ) -> EngineResult<SignAttestation> {
        let value = self.decrypt_slot(ct)?;
        SignAttestation::issue(value, statement, params.fixed_point_scale, params.range_bits)
    }
}

pub struct KeyHolderOracle {
    ctx: Arc<CkksContext>,
    secret: Arc<SecretKey>,
}

impl KeyHolderOracle {
    pub fn new(ctx: Arc<CkksContext>, secret: Arc<SecretKey>) -> Self {
        Self { ctx, secret }
    }
}

impl DecryptionOracle for KeyHolderOracle {
    fn decrypt_slot(&self, ct: &Ciphertext) -> EngineResult<f64> {
        ensure_context(&self.ctx, ct)?;
        let slots = decrypt(&self.ctx, &self.secret, ct)?;
        slots
            .first()
            .copied()
            .ok_or_else(|| EngineError::InvalidParameters("empty decryption".into()))
    }
}

/// A roster of share holders decrypting jointly.
pub struct ThresholdOracle {
    ctx: Arc<CkksContext>,
    policy: ThresholdPolicy,
    shares: Vec<KeyShare>,
    roster: Vec<u8>,
    rng: Mutex<ChaCha20Rng>,
}

impl ThresholdOracle {
    /// Uses the first `t` shares as the decrypting roster.
    pub fn new(ctx: Arc<CkksContext>, policy: ThresholdPolicy, shares: Vec<KeyShare>) -> EngineResult<Self> {
        if shares.len() < policy.t as usize {
            return Err(EngineError::InvalidThreshold {
                t: policy.t as usize,
                n: shares.len(),
            });
        }
        let roster = shares.iter().take(policy.t as usize).map(|s| s.index()).collect();
        Ok(Self {
            ctx,
            policy,
            shares,
            roster,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        })
    }

    pub fn roster(&self) -> &[u8] {
        &self.roster
    }
}

impl DecryptionOracle for ThresholdOracle {
    fn decrypt_slot(&self, ct: &Ciphertext) -> EngineResult<f64> {
        ensure_context(&self.ctx, ct)?;
        let mut rng = self.rng.lock();
        let partials = self
            .shares
            .iter()
            .filter(|s| self.roster.contains(&s.index()))
            .map(|share| partial_decrypt(&self.ctx, share, ct, &self.roster, &mut *rng))
            .collect::<Result<Vec<_>, _>>()?;
        let slots = combine(&self.ctx, ct, &partials, self.policy)?;
        slots
            .first()
            .copied()
            .ok_or_else(|| EngineError::InvalidParameters("empty decryption".into()))
    }
}

/// Right-hand side of a comparison.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Cipher(CiphertextHandle),
    Plain(f64),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub result: bool,
    pub op: ComparisonOp,
    pub attestations: Vec<SignAttestation>,
}

impl ComparisonOutcome {
    /// Checks every attestation and that `result` follows from the signs.
    pub fn verify(&self) -> bool {
        if !self.attestations.iter().all(SignAttestation::verify) {
            return false;
        }
        let signs: Vec<Sign> = self.attestations.iter().map(|a| a.sign).collect();
        match (self.op, signs.as_slice()) {
            (ComparisonOp::Greater, [upper]) => self.result == (*upper == Sign::Positive),
            (ComparisonOp::Less, [lower]) => self.result == (*lower == Sign::Negative),
            (ComparisonOp::Equal, [upper, lower]) => {
                self.result == (*upper != Sign::Positive && *lower != Sign::Negative)
            }
            _ => false,
        }
    }
}

pub struct SecureComparator {
    engine: Arc<HomomorphicEngine>,
    oracle: Arc<dyn DecryptionOracle>,
    tolerance: f64,
    params: AttestationParams,
}

impl SecureComparator {
    pub fn new(engine: Arc<HomomorphicEngine>, oracle: Arc<dyn DecryptionOracle>) -> Self {
        Self {
            engine,
            oracle,
            tolerance: 0.01,
            params: AttestationParams::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_params(mut self, params: AttestationParams) -> Self {
        self.params = params;
        self
    }

    pub fn engine(&self) -> &Arc<HomomorphicEngine> {
        &self.engine
    }

    fn difference(&self, a: CiphertextHandle, b: Operand) -> EngineResult<Ciphertext> {
        match b {
            Operand::Plain(threshold) => {
                if !threshold.is_finite() {
                    return Err(EngineError::InvalidParameters("threshold must be finite".into()));
                }
                let lhs = self.engine.vault().get(a)?;
                Ok(self.engine.evaluator().sub_plain(&lhs, &[threshold])?)
            }
            Operand::Cipher(other) => {
                let handle = self.engine.sub(a, other)?;
                let diff = self.engine.vault().get(handle)?;
                self.engine.vault().remove(handle)?;
                Ok(diff)
            }
        }
    }

    /// Blinds `diff + shift` and asks the oracle for its sign.
    fn attest_shifted(
        &self,
        diff: &Ciphertext,
        shift: f64,
        op: ComparisonOp,
        index: u8,
    ) -> EngineResult<SignAttestation> {
        let evaluator = self.engine.evaluator();
        let shifted = evaluator.add_plain(diff, &[shift])?;
        let blind = rand::thread_rng().gen_range(1..(1i64 << BLIND_BITS));
        let blinded = evaluator.multiply_integer(&shifted, blind)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"pcce/compare");
        hasher.update(&ciphertext_digest(&blinded));
        hasher.update(op.as_str().as_bytes());
        hasher.update(&[index]);
        let statement = *hasher.finalize().as_bytes();
        self.oracle.attest_sign(&blinded, statement, self.params)
    }

    /// Compares slot 0 of `a` against `b`. Differences within the tolerance
    /// count as equal.
    pub fn compare(&self, a: CiphertextHandle, b: Operand, op: ComparisonOp) -> EngineResult<ComparisonOutcome> {
        let diff = self.difference(a, b)?;
        let tol = self.tolerance;
        let (result, attestations) = match op {
            ComparisonOp::Greater => {
                let upper = self.attest_shifted(&diff, -tol, op, 0)?;
                (upper.sign == Sign::Positive, vec![upper])
            }
            ComparisonOp::Less => {
                let lower = self.attest_shifted(&diff, tol, op, 0)?;
                (lower.sign == Sign::Negative, vec![lower])
            }
            ComparisonOp::Equal => {
                let upper = self.attest_shifted(&diff, -tol, op, 0)?;
                let lower = self.attest_shifted(&diff, tol, op, 1)?;
                (
                    upper.sign != Sign::Positive && lower.sign != Sign::Negative,
                    vec![upper, lower],
                )
            }
        };
        self.engine.telemetry().incr(names::COMPARE_RUNS);
        debug!(op = op.as_str(), %a, result, "secure comparison");
        Ok(ComparisonOutcome {
            result,
            op,
            attestations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use crate::pool::WorkerPool;
    use pcce_telemetry::TelemetryHandle;

    fn comparator() -> SecureComparator {
        let manager = ContextManager::default().with_min_ring_dimension(64).with_seed(31);
        let ctx = manager.create_context(2, 40, 4).unwrap();
        let keys = manager.generate_keys(&ctx).unwrap();
        let engine = HomomorphicEngine::new(
            &keys.public,
            manager,
            WorkerPool::new(1).unwrap(),
            TelemetryHandle::default(),
        )
        .unwrap();
        let oracle = Arc::new(KeyHolderOracle::new(ctx, keys.secret.clone()));
        SecureComparator::new(Arc::new(engine), oracle)
    }

    #[test]
    fn compares_against_thresholds_and_ciphertexts() {
        let cmp = comparator();
        let score = cmp.engine().encrypt(&[85.0]).unwrap();
        let peer = cmp.engine().encrypt(&[72.5]).unwrap();

        let above = cmp.compare(score, Operand::Plain(80.0), ComparisonOp::Greater).unwrap();
        assert!(above.result);
        assert!(above.verify());
        assert!(!cmp.compare(score, Operand::Plain(90.0), ComparisonOp::Greater).unwrap().result);
        assert!(cmp.compare(peer, Operand::Cipher(score), ComparisonOp::Less).unwrap().result);
        assert!(!cmp.compare(score, Operand::Cipher(peer), ComparisonOp::Less).unwrap().result);

        let equal = cmp.compare(score, Operand::Plain(85.0), ComparisonOp::Equal).unwrap();
        assert!(equal.result);
        assert_eq!(equal.attestations.len(), 2);
        assert!(equal.verify());
        assert!(!cmp.compare(score, Operand::Plain(85.5), ComparisonOp::Equal).unwrap().result);
        assert_eq!(cmp.engine().telemetry().peek_counter(names::COMPARE_RUNS), 6);
    }

    #[test]
    fn sub_unit_differences_keep_their_sign() {
        for blinded in [0.0002, 0.004, 0.0002 * 255.0] {
            let positive = SignAttestation::issue(blinded, [1; 32], 100, 32).unwrap();
            assert_eq!(positive.sign, Sign::Positive);
            assert!(positive.verify());
            let negative = SignAttestation::issue(-blinded, [1; 32], 100, 32).unwrap();
            assert_eq!(negative.sign, Sign::Negative);
            assert!(negative.verify());
        }
        let zero = SignAttestation::issue(0.0, [1; 32], 100, 32).unwrap();
        assert_eq!(zero.sign, Sign::Zero);
        assert!(zero.verify());
    }

    #[test]
    fn repeated_comparisons_at_the_band_edge_agree() {
        let cmp = comparator().with_tolerance(0.01);
        let cases = [
            (80.0102, ComparisonOp::Greater, true),
            (80.0098, ComparisonOp::Greater, false),
            (79.9898, ComparisonOp::Less, true),
            (79.9902, ComparisonOp::Less, false),
        ];
        for (value, op, expected) in cases {
            let handle = cmp.engine().encrypt(&[value]).unwrap();
            for _ in 0..40 {
                let outcome = cmp.compare(handle, Operand::Plain(80.0), op).unwrap();
                assert_eq!(outcome.result, expected, "{value} {op:?} 80");
                assert!(outcome.verify());
            }
        }
    }

    #[test]
    fn tampered_attestations_fail() {
        let cmp = comparator();
        let score = cmp.engine().encrypt(&[85.0]).unwrap();
        let mut outcome = cmp.compare(score, Operand::Plain(80.0), ComparisonOp::Greater).unwrap();
        outcome.result = false;
        assert!(!outcome.verify());
        outcome.result = true;
        outcome.attestations[0].sign = Sign::Negative;
        assert!(!outcome.verify());
    }

    #[test]
    fn threshold_oracle_decrypts_with_a_roster() {
        let manager = ContextManager::default().with_min_ring_dimension(64).with_seed(8);
        let ctx = manager.create_context(1, 40, 4).unwrap();
        let material = manager.generate_threshold_keys(&ctx, 5, 3).unwrap();
        let engine = HomomorphicEngine::new(
            &material.public,
            manager,
            WorkerPool::new(1).unwrap(),
            TelemetryHandle::default(),
        )
        .unwrap();
        let oracle = ThresholdOracle::new(ctx, material.policy, material.shares).unwrap();
        assert_eq!(oracle.roster(), &[1, 2, 3]);
        let cmp = SecureComparator::new(Arc::new(engine), Arc::new(oracle));
        let risk = cmp.engine().encrypt(&[42.0]).unwrap();
        assert!(cmp.compare(risk, Operand::Plain(40.0), ComparisonOp::Greater).unwrap().result);
    }
}
