//! Write-once certificates that a ciphertext was irrecoverably discarded.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pcce_telemetry::{names, TelemetryHandle};
use pcce_zk::{verify_issued_proof, Predicate, ProofBundle, ProofType};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// The only claim a deletion proof may make.
pub const DELETION_CLAIM: &str = "retained_copies == 0";
const CERTIFICATE_DOMAIN: &[u8] = b"pcce/deletion";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionCertificate {
    pub certificate_id: String,
    pub ciphertext_hash: String,
    pub claim_hash: String,
    pub issued_at: DateTime<Utc>,
    pub verified: bool,
}

/// Deterministic in the ciphertext hash, so reissuing yields the same id.
pub fn certificate_id(ciphertext_hash: &[u8; 32]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CERTIFICATE_DOMAIN);
    hasher.update(ciphertext_hash);
    hasher.finalize().to_hex().to_string()
}

/// Certificates keyed by ciphertext hash. Only deletion proofs endorsed by
/// `issuer`, the key holder that discarded the evidence, are accepted.
pub struct DeletionRegistry {
    certificates: DashMap<[u8; 32], DeletionCertificate>,
    issuer: [u8; 32],
    telemetry: TelemetryHandle,
}

impl DeletionRegistry {
    pub fn new(telemetry: TelemetryHandle, issuer: [u8; 32]) -> Self {
        Self {
            certificates: DashMap::new(),
            issuer,
            telemetry,
        }
    }

    pub fn issuer(&self) -> [u8; 32] {
        self.issuer
    }

    fn check(&self, ciphertext_hash: &[u8; 32], proof: &ProofBundle) -> bool {
        let vk = &proof.verification_key;
        let Ok(expected) = Predicate::parse(DELETION_CLAIM) else {
            return false;
        };
        vk.proof_type == ProofType::DataDeletion
            && vk.predicate == expected
            && vk.evidence.contains(ciphertext_hash)
            && verify_issued_proof(&proof.proof, vk, &proof.claim_hash, &self.issuer)
    }

    /// Certifies that `ciphertext_hash` is gone. The first valid call
    /// creates the certificate; later valid calls return it unchanged.
    pub fn certify_deletion(
        &self,
        ciphertext_hash: &[u8; 32],
        proof: &ProofBundle,
    ) -> EngineResult<DeletionCertificate> {
        if !self.check(ciphertext_hash, proof) {
            return Err(EngineError::DeletionProofInvalid {
                ciphertext_hash: hex::encode(ciphertext_hash),
            });
        }
        match self.certificates.entry(*ciphertext_hash) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let certificate = DeletionCertificate {
                    certificate_id: certificate_id(ciphertext_hash),
                    ciphertext_hash: hex::encode(ciphertext_hash),
                    claim_hash: proof.claim_hash.to_hex(),
                    issued_at: Utc::now(),
                    verified: true,
                };
                self.telemetry.incr(names::DELETION_CERTIFIED);
                info!(
                    certificate = %certificate.certificate_id,
                    ciphertext = %certificate.ciphertext_hash,
                    "deletion certified"
                );
                slot.insert(certificate.clone());
                Ok(certificate)
            }
        }
    }

    pub fn get(&self, ciphertext_hash: &[u8; 32]) -> Option<DeletionCertificate> {
        self.certificates.get(ciphertext_hash).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcce_zk::{ClaimProver, ClaimRequest, IssuerKey, ProofScheme};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn issuer(seed: u64) -> IssuerKey {
        IssuerKey::generate(&mut ChaCha20Rng::seed_from_u64(seed))
    }

    fn bundle(
        issuer: &IssuerKey,
        claim: &str,
        proof_type: ProofType,
        evidence: &[[u8; 32]],
        witness: f64,
    ) -> ProofBundle {
        let prover = ClaimProver::new(100, 32).unwrap();
        let request = ClaimRequest {
            claim_text: claim,
            evidence,
            scheme: ProofScheme::default(),
            proof_type,
        };
        prover
            .prove(request, witness, issuer, &mut ChaCha20Rng::seed_from_u64(4))
            .unwrap()
    }

    #[test]
    fn repeat_certification_is_idempotent() {
        let key_holder = issuer(1);
        let registry = DeletionRegistry::new(TelemetryHandle::default(), key_holder.public());
        let hash = [7u8; 32];
        let proof = bundle(&key_holder, DELETION_CLAIM, ProofType::DataDeletion, &[hash], 0.0);
        let first = registry.certify_deletion(&hash, &proof).unwrap();
        let second = registry.certify_deletion(&hash, &proof).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.certificate_id, certificate_id(&hash));
        assert!(first.verified);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.telemetry().peek_counter(names::DELETION_CERTIFIED), 1);
    }

    #[test]
    fn rejects_proofs_for_other_hashes_or_claims() {
        let key_holder = issuer(1);
        let registry = DeletionRegistry::new(TelemetryHandle::default(), key_holder.public());
        let hash = [7u8; 32];
        let other = bundle(&key_holder, DELETION_CLAIM, ProofType::DataDeletion, &[[8u8; 32]], 0.0);
        let wrong_type = bundle(&key_holder, DELETION_CLAIM, ProofType::ComplianceCertificate, &[hash], 0.0);
        let wrong_claim = bundle(&key_holder, "retained_copies <= 5", ProofType::DataDeletion, &[hash], 2.0);
        for proof in [other, wrong_type, wrong_claim] {
            assert!(matches!(
                registry.certify_deletion(&hash, &proof),
                Err(EngineError::DeletionProofInvalid { .. })
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_deletions_not_endorsed_by_the_key_holder() {
        let registry = DeletionRegistry::new(TelemetryHandle::default(), issuer(1).public());
        let hash = [7u8; 32];
        let self_issued = bundle(&issuer(2), DELETION_CLAIM, ProofType::DataDeletion, &[hash], 0.0);
        assert!(matches!(
            registry.certify_deletion(&hash, &self_issued),
            Err(EngineError::DeletionProofInvalid { .. })
        ));
        assert!(registry.get(&hash).is_none());
        assert_eq!(registry.telemetry().peek_counter(names::DELETION_CERTIFIED), 0);
    }
}
