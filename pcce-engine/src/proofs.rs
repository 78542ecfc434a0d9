use std::sync::Arc;

use parking_lot::Mutex;
use pcce_telemetry::names;
use pcce_zk::{ClaimProver, ClaimRequest, IssuerKey, ProofBundle, ProofScheme, ProofType};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::info;

use crate::arithmetic::HomomorphicEngine;
use crate::comparison::DecryptionOracle;
use crate::config::ProofSection;
use crate::deletion::DELETION_CLAIM;
use crate::error::{EngineError, EngineResult};
use crate::vault::CiphertextHandle;

pub use pcce_zk::{verify_issued_proof, verify_proof};

/// Issues compliance proofs over vault evidence.
///
/// The first evidence hash names the ciphertext whose value is the witness;
/// any further hashes are bound into the claim as supporting references.
/// The witness is recovered by the [`DecryptionOracle`], so the engine never
/// sees it unless the oracle is the key holder itself. Bundles are endorsed
/// with the service's [`IssuerKey`] only after that recovery, or after the
/// evidence left the vault for deletion proofs; [`ProofService::verify`]
/// accepts nothing else.
pub struct ProofService {
    engine: Arc<HomomorphicEngine>,
    oracle: Arc<dyn DecryptionOracle>,
    prover: ClaimProver,
    issuer: IssuerKey,
    default_scheme: ProofScheme,
    rng: Mutex<ChaCha20Rng>,
}

impl ProofService {
    pub fn new(
        engine: Arc<HomomorphicEngine>,
        oracle: Arc<dyn DecryptionOracle>,
        settings: &ProofSection,
    ) -> EngineResult<Self> {
        let mut rng = ChaCha20Rng::from_entropy();
        Ok(Self {
            engine,
            oracle,
            prover: ClaimProver::new(settings.fixed_point_scale, settings.range_bits)?,
            issuer: IssuerKey::generate(&mut rng),
            default_scheme: settings.scheme,
            rng: Mutex::new(rng),
        })
    }

    pub fn with_seed(self, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Self {
            issuer: IssuerKey::generate(&mut rng),
            rng: Mutex::new(rng),
            ..self
        }
    }

    /// Public key every bundle from this service is endorsed with.
    pub fn issuer(&self) -> [u8; 32] {
        self.issuer.public()
    }

    pub fn default_scheme(&self) -> ProofScheme {
        self.default_scheme
    }

    /// Proves that the evidence satisfies the predicate in `claim_text`.
    /// `scheme` must name a supported construction.
    pub fn generate_proof(
        &self,
        claim_text: &str,
        evidence: &[[u8; 32]],
        scheme: &str,
        proof_type: ProofType,
    ) -> EngineResult<ProofBundle> {
        let scheme: ProofScheme = scheme.parse()?;
        let subject = evidence
            .first()
            .ok_or_else(|| EngineError::InvalidParameters("a claim needs at least one evidence hash".into()))?;
        let vault = self.engine.vault();
        let resolve = |hash: &[u8; 32]| {
            vault.find_by_hash(hash).ok_or_else(|| {
                EngineError::InvalidParameters(format!("unknown evidence {}", hex::encode(hash)))
            })
        };
        let witness_handle = resolve(subject)?;
        for hash in &evidence[1..] {
            resolve(hash)?;
        }
        let witness = self.oracle.decrypt_slot(&vault.get(witness_handle)?)?;
        self.issue(claim_text, evidence, scheme, proof_type, witness)
    }

    /// Like [`generate_proof`](Self::generate_proof) for an evidence handle
    /// already in the vault.
    pub fn prove_handle(
        &self,
        claim_text: &str,
        handle: CiphertextHandle,
        proof_type: ProofType,
    ) -> EngineResult<ProofBundle> {
        let hash = self.engine.vault().content_hash(handle)?;
        self.generate_proof(claim_text, &[hash], self.default_scheme.as_str(), proof_type)
    }

    fn issue(
        &self,
        claim_text: &str,
        evidence: &[[u8; 32]],
        scheme: ProofScheme,
        proof_type: ProofType,
        witness: f64,
    ) -> EngineResult<ProofBundle> {
        let request = ClaimRequest {
            claim_text,
            evidence,
            scheme,
            proof_type,
        };
        let bundle = self
            .prover
            .prove(request, witness, &self.issuer, &mut *self.rng.lock())?;
        self.engine.telemetry().incr(names::PROOF_ISSUED);
        info!(
            claim = %bundle.claim_hash,
            proof_type = proof_type.as_str(),
            evidence = evidence.len(),
            "compliance proof issued"
        );
        Ok(bundle)
    }

    /// Discards the ciphertext and proves that no copy is retained.
    /// Returns the hash the ciphertext was known by.
    pub fn prove_deletion(&self, handle: CiphertextHandle) -> EngineResult<([u8; 32], ProofBundle)> {
        let hash = self.engine.vault().remove(handle)?;
        if self.engine.vault().find_by_hash(&hash).is_some() {
            return Err(EngineError::DeletionProofInvalid {
                ciphertext_hash: hex::encode(hash),
            });
        }
        let bundle = self.issue(
            DELETION_CLAIM,
            &[hash],
            self.default_scheme,
            ProofType::DataDeletion,
            0.0,
        )?;
        Ok((hash, bundle))
    }

    /// Valid and endorsed by this service.
    pub fn verify(&self, bundle: &ProofBundle) -> bool {
        let valid = verify_issued_proof(
            &bundle.proof,
            &bundle.verification_key,
            &bundle.claim_hash,
            &self.issuer.public(),
        );
        if valid {
            self.engine.telemetry().incr(names::PROOF_VERIFIED);
        }
        valid
    }

    pub fn require_valid(&self, bundle: &ProofBundle) -> EngineResult<()> {
        if self.verify(bundle) {
            Ok(())
        } else {
            Err(EngineError::ProofVerificationFailed(format!(
                "claim {} does not verify",
                bundle.claim_hash
            )))
        }
    }
}
