//! Issuer endorsements.
//!
//! A proof bundle only says that *some* witness satisfies the predicate. The
//! issuer (the key holder that recovered the witness from the evidence)
//! signs the claim hash, the commitment and the evidence list with a
//! Schnorr proof of knowledge of its key, so verifiers can tell bundles from
//! the key holder apart from bundles anyone could compute.

use std::fmt;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::claim::ClaimHash;
use crate::pedersen::{decode_point, encode_point, random_scalar};
use crate::sigma::SchnorrProof;
use crate::transcript::Transcript;

const ENDORSEMENT_DOMAIN: &[u8] = b"pcce/issuer-endorsement/v1";

pub struct IssuerKey {
    secret: Scalar,
    public: RistrettoPoint,
}

impl IssuerKey {
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let secret = random_scalar(rng);
        Self {
            secret,
            public: RISTRETTO_BASEPOINT_POINT * secret,
        }
    }

    /// Compressed public key, published to verifiers.
    pub fn public(&self) -> [u8; 32] {
        encode_point(&self.public)
    }

    pub fn endorse<R: RngCore + CryptoRng + ?Sized>(
        &self,
        claim_hash: &ClaimHash,
        commitment: &[u8; 32],
        evidence: &[[u8; 32]],
        rng: &mut R,
    ) -> SchnorrProof {
        let mut transcript = endorsement_transcript(&self.public(), claim_hash, commitment, evidence);
        SchnorrProof::prove(&mut transcript, &RISTRETTO_BASEPOINT_POINT, &self.public, self.secret, rng)
    }
}

impl Drop for IssuerKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl fmt::Debug for IssuerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerKey")
            .field("public", &hex::encode(self.public()))
            .finish_non_exhaustive()
    }
}

fn endorsement_transcript(
    issuer: &[u8; 32],
    claim_hash: &ClaimHash,
    commitment: &[u8; 32],
    evidence: &[[u8; 32]],
) -> Transcript {
    let mut transcript = Transcript::new(ENDORSEMENT_DOMAIN);
    transcript.append(b"issuer", issuer);
    transcript.append(b"claim-hash", &claim_hash.0);
    transcript.append(b"commitment", commitment);
    transcript.append_u64(b"evidence-len", evidence.len() as u64);
    for hash in evidence {
        transcript.append(b"evidence", hash);
    }
    transcript
}

pub fn verify_endorsement(
    endorsement: &SchnorrProof,
    issuer: &[u8; 32],
    claim_hash: &ClaimHash,
    commitment: &[u8; 32],
    evidence: &[[u8; 32]],
) -> bool {
    let Ok(public) = decode_point(issuer) else {
        return false;
    };
    let mut transcript = endorsement_transcript(issuer, claim_hash, commitment, evidence);
    endorsement.verify(&mut transcript, &RISTRETTO_BASEPOINT_POINT, &public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn endorsements_cover_every_public_input() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let issuer = IssuerKey::generate(&mut rng);
        let claim = ClaimHash([1; 32]);
        let evidence = [[2; 32], [3; 32]];
        let signature = issuer.endorse(&claim, &[4; 32], &evidence, &mut rng);
        assert!(verify_endorsement(&signature, &issuer.public(), &claim, &[4; 32], &evidence));

        assert!(!verify_endorsement(&signature, &issuer.public(), &ClaimHash([9; 32]), &[4; 32], &evidence));
        assert!(!verify_endorsement(&signature, &issuer.public(), &claim, &[5; 32], &evidence));
        assert!(!verify_endorsement(&signature, &issuer.public(), &claim, &[4; 32], &evidence[..1]));
        let stranger = IssuerKey::generate(&mut rng);
        assert!(!verify_endorsement(&signature, &stranger.public(), &claim, &[4; 32], &evidence));
    }
}
