//! Issuing and verifying compliance proof bundles.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::claim::{ClaimHash, Comparison, Predicate, ProofScheme, ProofType};
use crate::error::{ZkError, ZkResult};
use crate::issuer::{verify_endorsement, IssuerKey};
use crate::pedersen::{decode_point, encode_point, random_scalar, scalar_from_i64, Generators};
use crate::range::{RangeProof, MAX_RANGE_BITS};
use crate::sigma::SchnorrProof;
use crate::transcript::Transcript;

const PROOF_DOMAIN: &[u8] = b"pcce/compliance-proof/v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProofBody {
    /// Range proof on the committed slack between value and threshold.
    Range(RangeProof),
    /// Knowledge of the blinding of `C - t·G`, i.e. `C` opens to `t`.
    Opening(SchnorrProof),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceProof {
    pub scheme: ProofScheme,
    pub body: ProofBody,
    /// The issuer's signature over the claim hash, commitment and evidence.
    pub endorsement: SchnorrProof,
}

impl ComplianceProof {
    pub fn to_bytes(&self) -> ZkResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| ZkError::Encoding("proof serialization"))
    }

    pub fn from_bytes(bytes: &[u8]) -> ZkResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| ZkError::Encoding("proof deserialization"))
    }
}

/// Everything a third party needs to check a proof. Contains no secret and
/// no reference to engine state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub scheme: ProofScheme,
    pub proof_type: ProofType,
    pub claim_text: String,
    pub predicate: Predicate,
    pub fixed_point_scale: u32,
    pub range_bits: u32,
    pub commitment: [u8; 32],
    pub evidence: Vec<[u8; 32]>,
    /// Public key of the key holder that recovered the witness.
    pub issuer: [u8; 32],
}

impl VerificationKey {
    pub fn claim_hash(&self) -> ClaimHash {
        ClaimHash::compute(self.proof_type, &self.claim_text, &self.predicate, &self.evidence)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub proof: ComplianceProof,
    pub verification_key: VerificationKey,
    pub claim_hash: ClaimHash,
}

/// Public inputs of a proof request.
#[derive(Clone, Debug)]
pub struct ClaimRequest<'a> {
    pub claim_text: &'a str,
    pub evidence: &'a [[u8; 32]],
    pub scheme: ProofScheme,
    pub proof_type: ProofType,
}

#[derive(Clone, Copy, Debug)]
pub struct ClaimProver {
    gens: Generators,
    fixed_point_scale: u32,
    range_bits: u32,
}

fn to_fixed(value: f64, scale: u32) -> ZkResult<i64> {
    let scaled = (value * scale as f64).round();
    if !scaled.is_finite() || scaled.abs() >= (1u64 << 62) as f64 {
        return Err(ZkError::InvalidParameters("value outside fixed-point range".into()));
    }
    Ok(scaled as i64)
}

/// Offset `k` and sign such that the committed slack is `sign·(C_v) - k·G`.
fn slack_form(op: Comparison, threshold: i64) -> (bool, i128) {
    let t = threshold as i128;
    match op {
        Comparison::AtLeast | Comparison::Equal => (true, t),
        Comparison::GreaterThan => (true, t + 1),
        Comparison::AtMost => (false, t),
        Comparison::LessThan => (false, t - 1),
    }
}

fn scalar_from_i128(value: i128) -> Scalar {
    if value < 0 {
        -Scalar::from(value.unsigned_abs())
    } else {
        Scalar::from(value as u128)
    }
}

fn slack_commitment(gens: &Generators, commitment: &RistrettoPoint, op: Comparison, threshold: i64) -> RistrettoPoint {
    let (positive, offset) = slack_form(op, threshold);
    let shifted = gens.g * scalar_from_i128(offset);
    if positive {
        commitment - shifted
    } else {
        shifted - commitment
    }
}

fn bind(transcript: &mut Transcript, vk: &VerificationKey, claim_hash: &ClaimHash) {
    transcript.append(b"scheme", vk.scheme.as_str().as_bytes());
    transcript.append(b"claim-hash", &claim_hash.0);
    transcript.append(b"predicate", vk.predicate.canonical().as_bytes());
    transcript.append_u64(b"fixed-point", vk.fixed_point_scale as u64);
    transcript.append(b"commitment", &vk.commitment);
    transcript.append(b"issuer", &vk.issuer);
}

impl ClaimProver {
    pub fn new(fixed_point_scale: u32, range_bits: u32) -> ZkResult<Self> {
        if fixed_point_scale == 0 {
            return Err(ZkError::InvalidParameters("fixed-point scale must be positive".into()));
        }
        if range_bits == 0 || range_bits > MAX_RANGE_BITS {
            return Err(ZkError::InvalidParameters(format!(
                "range bits must be within 1..={MAX_RANGE_BITS}"
            )));
        }
        Ok(Self {
            gens: Generators::default(),
            fixed_point_scale,
            range_bits,
        })
    }

    /// Proves that `witness` satisfies the predicate in `request.claim_text`
    /// and endorses the result as `issuer`.
    pub fn prove<R: RngCore + CryptoRng + ?Sized>(
        &self,
        request: ClaimRequest<'_>,
        witness: f64,
        issuer: &IssuerKey,
        rng: &mut R,
    ) -> ZkResult<ProofBundle> {
        let predicate = Predicate::parse(request.claim_text)?;
        let value = to_fixed(witness, self.fixed_point_scale)?;
        let threshold = to_fixed(predicate.threshold, self.fixed_point_scale)?;
        if !predicate.op.holds(value, threshold) {
            return Err(ZkError::PredicateUnsatisfied);
        }

        let blinding = random_scalar(rng);
        let commitment = self.gens.commit(scalar_from_i64(value), blinding);
        let verification_key = VerificationKey {
            scheme: request.scheme,
            proof_type: request.proof_type,
            claim_text: request.claim_text.to_owned(),
            predicate,
            fixed_point_scale: self.fixed_point_scale,
            range_bits: self.range_bits,
            commitment: encode_point(&commitment),
            evidence: request.evidence.to_vec(),
            issuer: issuer.public(),
        };
        let claim_hash = verification_key.claim_hash();
        let mut transcript = Transcript::new(PROOF_DOMAIN);
        bind(&mut transcript, &verification_key, &claim_hash);

        let op = verification_key.predicate.op;
        let (positive, offset) = slack_form(op, threshold);
        let body = if op == Comparison::Equal {
            let target = slack_commitment(&self.gens, &commitment, op, threshold);
            ProofBody::Opening(SchnorrProof::prove(&mut transcript, &self.gens.h, &target, blinding, rng))
        } else {
            let slack = if positive {
                value as i128 - offset
            } else {
                offset - value as i128
            };
            let slack = u64::try_from(slack).map_err(|_| ZkError::PredicateUnsatisfied)?;
            let slack_blinding = if positive { blinding } else { -blinding };
            ProofBody::Range(RangeProof::prove(
                &self.gens,
                &mut transcript,
                slack,
                slack_blinding,
                self.range_bits,
                rng,
            )?)
        };
        let endorsement = issuer.endorse(
            &claim_hash,
            &verification_key.commitment,
            &verification_key.evidence,
            rng,
        );
        debug!(claim = %claim_hash, proof_type = request.proof_type.as_str(), "compliance proof issued");
        Ok(ProofBundle {
            proof: ComplianceProof {
                scheme: request.scheme,
                body,
                endorsement,
            },
            verification_key,
            claim_hash,
        })
    }
}

/// Third-party verification: needs only the proof, the verification key
/// and the claim hash the verifier expects. Checks the endorsement against
/// `vk.issuer`; use [`verify_issued_proof`] to also pin the issuer.
pub fn verify_proof(proof: &ComplianceProof, vk: &VerificationKey, claim_hash: &ClaimHash) -> bool {
    if proof.scheme != vk.scheme || vk.claim_hash() != *claim_hash {
        return false;
    }
    if !verify_endorsement(&proof.endorsement, &vk.issuer, claim_hash, &vk.commitment, &vk.evidence) {
        return false;
    }
    let Ok(threshold) = to_fixed(vk.predicate.threshold, vk.fixed_point_scale.max(1)) else {
        return false;
    };
    let Ok(commitment) = decode_point(&vk.commitment) else {
        return false;
    };
    let gens = Generators::default();
    let mut transcript = Transcript::new(PROOF_DOMAIN);
    bind(&mut transcript, vk, claim_hash);
    let target = slack_commitment(&gens, &commitment, vk.predicate.op, threshold);
    match (&proof.body, vk.predicate.op) {
        (ProofBody::Opening(schnorr), Comparison::Equal) => schnorr.verify(&mut transcript, &gens.h, &target),
        (ProofBody::Range(range), op) if op != Comparison::Equal => {
            range.bits == vk.range_bits && range.verify(&gens, &mut transcript, &target)
        }
        _ => false,
    }
}

/// [`verify_proof`] for a bundle that must come from the issuer `issuer`.
pub fn verify_issued_proof(
    proof: &ComplianceProof,
    vk: &VerificationKey,
    claim_hash: &ClaimHash,
    issuer: &[u8; 32],
) -> bool {
    vk.issuer == *issuer && verify_proof(proof, vk, claim_hash)
}
