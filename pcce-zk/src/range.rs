//! Bit-decomposition range proofs over Pedersen commitments.
//!
//! For `C = v·G + r·H` with `0 <= v < 2^bits`, the prover commits to every
//! bit `C_i = b_i·G + r_i·H` with `Σ 2^i r_i = r`, and attaches a
//! Chaum-Pedersen OR proof that each `C_i` opens to 0 or 1. The verifier
//! checks that the bit commitments recombine to `C`.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{ZkError, ZkResult};
use crate::pedersen::{decode_point, decode_scalar, encode_point, random_scalar, Generators};
use crate::transcript::Transcript;

pub const MAX_RANGE_BITS: u32 = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitProof {
    pub commitment: [u8; 32],
    pub e0: [u8; 32],
    pub e1: [u8; 32],
    pub z0: [u8; 32],
    pub z1: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    pub bits: u32,
    pub bit_proofs: Vec<BitProof>,
}

fn two_pow(i: u32) -> Scalar {
    Scalar::from(1u128 << i)
}

impl RangeProof {
    /// Proves `value ∈ [0, 2^bits)` for the commitment `value·G + blinding·H`.
    pub fn prove<R: RngCore + CryptoRng + ?Sized>(
        gens: &Generators,
        transcript: &mut Transcript,
        value: u64,
        blinding: Scalar,
        bits: u32,
        rng: &mut R,
    ) -> ZkResult<Self> {
        if bits == 0 || bits > MAX_RANGE_BITS {
            return Err(ZkError::InvalidParameters(format!(
                "range size must be within 1..={MAX_RANGE_BITS} bits"
            )));
        }
        if bits < 64 && value >> bits != 0 {
            return Err(ZkError::OutOfRange { bits });
        }
        transcript.append_u64(b"range-bits", bits as u64);

        // Blindings for all but the top bit are random; the top one absorbs
        // the remainder so that the weighted sum equals `blinding`.
        let mut blindings: Vec<Scalar> = (0..bits - 1).map(|_| random_scalar(rng)).collect();
        let partial: Scalar = blindings
            .iter()
            .enumerate()
            .map(|(i, r)| two_pow(i as u32) * r)
            .sum();
        let top = (blinding - partial) * two_pow(bits - 1).invert();
        blindings.push(top);

        let mut bit_proofs = Vec::with_capacity(bits as usize);
        for (i, r) in blindings.iter().enumerate() {
            let bit = (value >> i) & 1 == 1;
            bit_proofs.push(prove_bit(gens, transcript, bit, *r, rng));
        }
        for r in blindings.iter_mut() {
            r.zeroize();
        }
        Ok(Self { bits, bit_proofs })
    }

    pub fn verify(
        &self,
        gens: &Generators,
        transcript: &mut Transcript,
        commitment: &RistrettoPoint,
    ) -> bool {
        self.check(gens, transcript, commitment).unwrap_or(false)
    }

    fn check(
        &self,
        gens: &Generators,
        transcript: &mut Transcript,
        commitment: &RistrettoPoint,
    ) -> ZkResult<bool> {
        if self.bits == 0 || self.bits > MAX_RANGE_BITS || self.bit_proofs.len() != self.bits as usize {
            return Ok(false);
        }
        transcript.append_u64(b"range-bits", self.bits as u64);
        let mut recombined = RistrettoPoint::identity();
        for (i, proof) in self.bit_proofs.iter().enumerate() {
            let c = decode_point(&proof.commitment)?;
            if !verify_bit(gens, transcript, &c, proof)? {
                return Ok(false);
            }
            recombined += c * two_pow(i as u32);
        }
        Ok(recombined == *commitment)
    }
}

fn bit_transcript(
    transcript: &mut Transcript,
    c: &RistrettoPoint,
    a0: &RistrettoPoint,
    a1: &RistrettoPoint,
) -> Scalar {
    transcript.append_point(b"bit-commitment", c);
    transcript.append_point(b"bit-a0", a0);
    transcript.append_point(b"bit-a1", a1);
    transcript.challenge(b"bit-challenge")
}

fn prove_bit<R: RngCore + CryptoRng + ?Sized>(
    gens: &Generators,
    transcript: &mut Transcript,
    bit: bool,
    blinding: Scalar,
    rng: &mut R,
) -> BitProof {
    let value = if bit { Scalar::ONE } else { Scalar::ZERO };
    let c = gens.commit(value, blinding);
    // Statement k: C - k·G = x·H.
    let targets = [c, c - gens.g];
    let real = usize::from(bit);
    let fake = 1 - real;

    let k = random_scalar(rng);
    let e_fake = random_scalar(rng);
    let z_fake = random_scalar(rng);
    let mut a = [RistrettoPoint::identity(); 2];
    a[real] = gens.h * k;
    a[fake] = gens.h * z_fake - targets[fake] * e_fake;

    let e = bit_transcript(transcript, &c, &a[0], &a[1]);
    let e_real = e - e_fake;
    let z_real = k + e_real * blinding;

    let mut es = [Scalar::ZERO; 2];
    let mut zs = [Scalar::ZERO; 2];
    es[real] = e_real;
    es[fake] = e_fake;
    zs[real] = z_real;
    zs[fake] = z_fake;
    BitProof {
        commitment: encode_point(&c),
        e0: es[0].to_bytes(),
        e1: es[1].to_bytes(),
        z0: zs[0].to_bytes(),
        z1: zs[1].to_bytes(),
    }
}

fn verify_bit(
    gens: &Generators,
    transcript: &mut Transcript,
    c: &RistrettoPoint,
    proof: &BitProof,
) -> ZkResult<bool> {
    let e0 = decode_scalar(&proof.e0)?;
    let e1 = decode_scalar(&proof.e1)?;
    let z0 = decode_scalar(&proof.z0)?;
    let z1 = decode_scalar(&proof.z1)?;
    let a0 = gens.h * z0 - c * e0;
    let a1 = gens.h * z1 - (c - gens.g) * e1;
    let e = bit_transcript(transcript, c, &a0, &a1);
    Ok(e == e0 + e1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn prove(value: u64, bits: u32) -> (RangeProof, RistrettoPoint) {
        let gens = Generators::default();
        let mut rng = ChaCha20Rng::seed_from_u64(value);
        let r = random_scalar(&mut rng);
        let c = gens.commit(Scalar::from(value), r);
        let proof = RangeProof::prove(&gens, &mut Transcript::new(b"t"), value, r, bits, &mut rng).unwrap();
        (proof, c)
    }

    #[test]
    fn honest_proof_verifies() {
        let gens = Generators::default();
        for value in [0u64, 1, 500, (1 << 16) - 1] {
            let (proof, c) = prove(value, 16);
            assert!(proof.verify(&gens, &mut Transcript::new(b"t"), &c));
        }
    }

    #[test]
    fn out_of_range_value_cannot_be_proven() {
        let gens = Generators::default();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let err = RangeProof::prove(&gens, &mut Transcript::new(b"t"), 1 << 8, Scalar::ONE, 8, &mut rng)
            .unwrap_err();
        assert_eq!(err, ZkError::OutOfRange { bits: 8 });
    }

    #[test]
    fn proof_is_bound_to_commitment_and_transcript() {
        let gens = Generators::default();
        let (proof, c) = prove(42, 8);
        assert!(!proof.verify(&gens, &mut Transcript::new(b"t"), &(c + gens.g)));
        assert!(!proof.verify(&gens, &mut Transcript::new(b"other"), &c));
    }

    #[test]
    fn tampered_bit_is_detected() {
        let gens = Generators::default();
        let (mut proof, c) = prove(42, 8);
        let bit = &mut proof.bit_proofs[0];
        std::mem::swap(&mut bit.e0, &mut bit.e1);
        assert!(!proof.verify(&gens, &mut Transcript::new(b"t"), &c));
    }
}
