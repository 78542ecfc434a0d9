use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::Sha512;

use crate::error::{ZkError, ZkResult};

const BLINDING_GENERATOR_DOMAIN: &[u8] = b"pcce/pedersen/blinding-generator";

/// `G` is the Ristretto basepoint; `H` is hashed to the group so nobody
/// knows `log_G(H)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Generators {
    pub g: RistrettoPoint,
    pub h: RistrettoPoint,
}

impl Default for Generators {
    fn default() -> Self {
        Self {
            g: RISTRETTO_BASEPOINT_POINT,
            h: RistrettoPoint::hash_from_bytes::<Sha512>(BLINDING_GENERATOR_DOMAIN),
        }
    }
}

impl Generators {
    pub fn commit(&self, value: Scalar, blinding: Scalar) -> RistrettoPoint {
        self.g * value + self.h * blinding
    }
}

pub fn random_scalar<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub fn scalar_from_i64(value: i64) -> Scalar {
    if value < 0 {
        -Scalar::from(value.unsigned_abs())
    } else {
        Scalar::from(value as u64)
    }
}

pub fn encode_point(point: &RistrettoPoint) -> [u8; 32] {
    point.compress().to_bytes()
}

pub fn decode_point(bytes: &[u8; 32]) -> ZkResult<RistrettoPoint> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or(ZkError::Encoding("not a ristretto point"))
}

pub fn decode_scalar(bytes: &[u8; 32]) -> ZkResult<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
        .ok_or(ZkError::Encoding("non-canonical scalar"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn commitments_are_additively_homomorphic() {
        let gens = Generators::default();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (r1, r2) = (random_scalar(&mut rng), random_scalar(&mut rng));
        let sum = gens.commit(Scalar::from(3u64), r1) + gens.commit(Scalar::from(4u64), r2);
        assert_eq!(sum, gens.commit(Scalar::from(7u64), r1 + r2));
    }

    #[test]
    fn negative_values_map_to_field_negation() {
        assert_eq!(scalar_from_i64(-5) + Scalar::from(5u64), Scalar::ZERO);
    }

    #[test]
    fn points_round_trip_and_garbage_is_rejected() {
        let gens = Generators::default();
        assert_eq!(decode_point(&encode_point(&gens.h)).unwrap(), gens.h);
        assert!(decode_point(&[0xff; 32]).is_err());
        assert!(decode_scalar(&[0xff; 32]).is_err());
    }
}
