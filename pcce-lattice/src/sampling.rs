use rand::{CryptoRng, Rng};
use rand_distr::{Distribution, Normal};

/// Standard deviation of the discrete Gaussian error distribution.
pub const ERROR_STD_DEV: f64 = 3.2;
const ERROR_TAIL_CUT: f64 = 6.0 * ERROR_STD_DEV;

pub fn ternary<R: Rng + CryptoRng + ?Sized>(n: usize, rng: &mut R) -> Vec<i64> {
    (0..n).map(|_| rng.gen_range(-1i64..=1)).collect()
}

pub fn gaussian<R: Rng + CryptoRng + ?Sized>(n: usize, rng: &mut R) -> Vec<i64> {
    let normal = match Normal::new(0.0, ERROR_STD_DEV) {
        Ok(normal) => normal,
        Err(_) => return vec![0; n],
    };
    (0..n)
        .map(|_| {
            let sample: f64 = normal.sample(rng);
            sample.clamp(-ERROR_TAIL_CUT, ERROR_TAIL_CUT).round() as i64
        })
        .collect()
}

pub fn uniform<R: Rng + CryptoRng + ?Sized>(n: usize, modulus: u64, rng: &mut R) -> Vec<u64> {
    (0..n).map(|_| rng.gen_range(0..modulus)).collect()
}

/// Uniform integers in `[-bound, bound]`, used to smudge partial decryptions.
pub fn bounded<R: Rng + CryptoRng + ?Sized>(n: usize, bound: i64, rng: &mut R) -> Vec<i64> {
    (0..n).map(|_| rng.gen_range(-bound..=bound)).collect()
}
