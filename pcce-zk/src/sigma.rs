use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::MultiscalarMul;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{ZkError, ZkResult};
use crate::pedersen::{decode_scalar, random_scalar};
use crate::transcript::Transcript;

/// Proof of knowledge of `x` with `target = x·base`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrProof {
    pub challenge: [u8; 32],
    pub response: [u8; 32],
}

impl SchnorrProof {
    pub fn prove<R: RngCore + CryptoRng + ?Sized>(
        transcript: &mut Transcript,
        base: &RistrettoPoint,
        target: &RistrettoPoint,
        secret: Scalar,
        rng: &mut R,
    ) -> Self {
        let k = random_scalar(rng);
        let nonce = base * k;
        let e = schnorr_challenge(transcript, base, target, &nonce);
        Self {
            challenge: e.to_bytes(),
            response: (k + e * secret).to_bytes(),
        }
    }

    pub fn verify(&self, transcript: &mut Transcript, base: &RistrettoPoint, target: &RistrettoPoint) -> bool {
        let (Ok(e), Ok(z)) = (decode_scalar(&self.challenge), decode_scalar(&self.response)) else {
            return false;
        };
        let nonce = base * z - target * e;
        schnorr_challenge(transcript, base, target, &nonce) == e
    }
}

fn schnorr_challenge(
    transcript: &mut Transcript,
    base: &RistrettoPoint,
    target: &RistrettoPoint,
    nonce: &RistrettoPoint,
) -> Scalar {
    transcript.append_point(b"schnorr-base", base);
    transcript.append_point(b"schnorr-target", target);
    transcript.append_point(b"schnorr-nonce", nonce);
    transcript.challenge(b"schnorr-challenge")
}

/// Batched Chaum-Pedersen proof that `outputs[i] = k·inputs[i]` for every
/// `i` and `public = k·G`, all with the same secret `k`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DleqProof {
    pub challenge: [u8; 32],
    pub response: [u8; 32],
}

fn batch(
    transcript: &mut Transcript,
    inputs: &[RistrettoPoint],
    outputs: &[RistrettoPoint],
) -> (RistrettoPoint, RistrettoPoint) {
    transcript.append_u64(b"dleq-len", inputs.len() as u64);
    for (i, o) in inputs.iter().zip(outputs) {
        transcript.append_point(b"dleq-in", i);
        transcript.append_point(b"dleq-out", o);
    }
    let weights: Vec<Scalar> = (0..inputs.len())
        .map(|_| transcript.challenge(b"dleq-weight"))
        .collect();
    (
        RistrettoPoint::multiscalar_mul(&weights, inputs),
        RistrettoPoint::multiscalar_mul(&weights, outputs),
    )
}

fn dleq_challenge(
    transcript: &mut Transcript,
    base: &RistrettoPoint,
    public: &RistrettoPoint,
    m: &RistrettoPoint,
    z: &RistrettoPoint,
    a1: &RistrettoPoint,
    a2: &RistrettoPoint,
) -> Scalar {
    transcript.append_point(b"dleq-base", base);
    transcript.append_point(b"dleq-public", public);
    transcript.append_point(b"dleq-m", m);
    transcript.append_point(b"dleq-z", z);
    transcript.append_point(b"dleq-a1", a1);
    transcript.append_point(b"dleq-a2", a2);
    transcript.challenge(b"dleq-challenge")
}

impl DleqProof {
    pub fn prove<R: RngCore + CryptoRng + ?Sized>(
        transcript: &mut Transcript,
        base: &RistrettoPoint,
        secret: Scalar,
        inputs: &[RistrettoPoint],
        outputs: &[RistrettoPoint],
        rng: &mut R,
    ) -> ZkResult<Self> {
        if inputs.len() != outputs.len() {
            return Err(ZkError::InvalidParameters(
                "dleq inputs and outputs differ in length".into(),
            ));
        }
        let public = base * secret;
        let (m, z) = batch(transcript, inputs, outputs);
        let k = random_scalar(rng);
        let (a1, a2) = (base * k, m * k);
        let e = dleq_challenge(transcript, base, &public, &m, &z, &a1, &a2);
        Ok(Self {
            challenge: e.to_bytes(),
            response: (k + e * secret).to_bytes(),
        })
    }

    pub fn verify(
        &self,
        transcript: &mut Transcript,
        base: &RistrettoPoint,
        public: &RistrettoPoint,
        inputs: &[RistrettoPoint],
        outputs: &[RistrettoPoint],
    ) -> bool {
        if inputs.len() != outputs.len() {
            return false;
        }
        let (Ok(e), Ok(s)) = (decode_scalar(&self.challenge), decode_scalar(&self.response)) else {
            return false;
        };
        let (m, z) = batch(transcript, inputs, outputs);
        let a1 = base * s - public * e;
        let a2 = m * s - z * e;
        dleq_challenge(transcript, base, public, &m, &z, &a1, &a2) == e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT as G;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn schnorr_round_trip() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let x = random_scalar(&mut rng);
        let target = G * x;
        let proof = SchnorrProof::prove(&mut Transcript::new(b"s"), &G, &target, x, &mut rng);
        assert!(proof.verify(&mut Transcript::new(b"s"), &G, &target));
        assert!(!proof.verify(&mut Transcript::new(b"s"), &G, &(target + G)));
    }

    #[test]
    fn dleq_detects_inconsistent_exponent() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let k = random_scalar(&mut rng);
        let inputs: Vec<_> = (0..4).map(|_| G * random_scalar(&mut rng)).collect();
        let mut outputs: Vec<_> = inputs.iter().map(|p| p * k).collect();
        let proof = DleqProof::prove(&mut Transcript::new(b"d"), &G, k, &inputs, &outputs, &mut rng).unwrap();
        assert!(proof.verify(&mut Transcript::new(b"d"), &G, &(G * k), &inputs, &outputs));
        outputs[2] = outputs[2] + G;
        assert!(!proof.verify(&mut Transcript::new(b"d"), &G, &(G * k), &inputs, &outputs));
    }
}
