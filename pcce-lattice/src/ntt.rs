//! Negacyclic number-theoretic transform over `Z_q[X]/(X^N + 1)`.
//!
//! Forward is Cooley-Tukey with bit-reversed powers of ψ, inverse is
//! Gentleman-Sande with bit-reversed powers of ψ⁻¹ followed by a scaling by
//! N⁻¹. Evaluation-domain outputs are in bit-reversed order, which is fine
//! because they are only ever multiplied pointwise.

use crate::arith::{add_mod, inv_mod, mul_mod, pow_mod, primitive_root_2n, sub_mod};
use crate::error::{LatticeError, LatticeResult};

#[derive(Clone, Debug)]
pub struct NttTable {
    modulus: u64,
    ring_dimension: usize,
    psi_powers: Vec<u64>,
    psi_inv_powers: Vec<u64>,
    n_inv: u64,
}

fn bit_reverse(x: usize, bits: u32) -> usize {
    if bits == 0 {
        0
    } else {
        x.reverse_bits() >> (usize::BITS - bits)
    }
}

impl NttTable {
    pub fn new(modulus: u64, ring_dimension: usize) -> LatticeResult<Self> {
        if !ring_dimension.is_power_of_two() || ring_dimension < 2 {
            return Err(LatticeError::InvalidParameters(
                "ring dimension must be a power of two".into(),
            ));
        }
        let psi = primitive_root_2n(modulus, ring_dimension)?;
        let psi_inv = inv_mod(psi, modulus)
            .ok_or_else(|| LatticeError::InvalidParameters("degenerate root".into()))?;
        let log_n = ring_dimension.trailing_zeros();
        let mut psi_powers = Vec::with_capacity(ring_dimension);
        let mut psi_inv_powers = Vec::with_capacity(ring_dimension);
        for i in 0..ring_dimension {
            let e = bit_reverse(i, log_n) as u64;
            psi_powers.push(pow_mod(psi, e, modulus));
            psi_inv_powers.push(pow_mod(psi_inv, e, modulus));
        }
        let n_inv = inv_mod(ring_dimension as u64, modulus)
            .ok_or_else(|| LatticeError::InvalidParameters("ring dimension not invertible".into()))?;
        Ok(Self {
            modulus,
            ring_dimension,
            psi_powers,
            psi_inv_powers,
            n_inv,
        })
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn forward(&self, a: &mut [u64]) {
        let q = self.modulus;
        let n = self.ring_dimension;
        let mut t = n;
        let mut m = 1;
        while m < n {
            t /= 2;
            for i in 0..m {
                let j1 = 2 * i * t;
                let s = self.psi_powers[m + i];
                for j in j1..j1 + t {
                    let u = a[j];
                    let v = mul_mod(a[j + t], s, q);
                    a[j] = add_mod(u, v, q);
                    a[j + t] = sub_mod(u, v, q);
                }
            }
            m *= 2;
        }
    }

    pub fn inverse(&self, a: &mut [u64]) {
        let q = self.modulus;
        let mut t = 1;
        let mut m = self.ring_dimension;
        while m > 1 {
            let h = m / 2;
            let mut j1 = 0;
            for i in 0..h {
                let s = self.psi_inv_powers[h + i];
                for j in j1..j1 + t {
                    let u = a[j];
                    let v = a[j + t];
                    a[j] = add_mod(u, v, q);
                    a[j + t] = mul_mod(sub_mod(u, v, q), s, q);
                }
                j1 += 2 * t;
            }
            t *= 2;
            m = h;
        }
        for x in a.iter_mut() {
            *x = mul_mod(*x, self.n_inv, q);
        }
    }

    /// Negacyclic product of two coefficient-domain polynomials.
    pub fn multiply(&self, a: &[u64], b: &[u64]) -> Vec<u64> {
        let mut fa = a.to_vec();
        let mut fb = b.to_vec();
        self.forward(&mut fa);
        self.forward(&mut fb);
        for (x, y) in fa.iter_mut().zip(&fb) {
            *x = mul_mod(*x, *y, self.modulus);
        }
        self.inverse(&mut fa);
        fa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::find_ntt_primes;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    fn schoolbook(a: &[u64], b: &[u64], q: u64) -> Vec<u64> {
        let n = a.len();
        let mut out = vec![0u64; n];
        for i in 0..n {
            for j in 0..n {
                let prod = mul_mod(a[i], b[j], q);
                let k = i + j;
                if k < n {
                    out[k] = add_mod(out[k], prod, q);
                } else {
                    out[k - n] = sub_mod(out[k - n], prod, q);
                }
            }
        }
        out
    }

    #[test]
    fn matches_schoolbook_negacyclic_product() {
        let n = 32;
        let q = find_ntt_primes(45, n, 1, &[]).unwrap()[0];
        let table = NttTable::new(q, n).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let a: Vec<u64> = (0..n).map(|_| rng.gen_range(0..q)).collect();
        let b: Vec<u64> = (0..n).map(|_| rng.gen_range(0..q)).collect();
        assert_eq!(table.multiply(&a, &b), schoolbook(&a, &b, q));
    }

    #[test]
    fn forward_then_inverse_is_identity() {
        let n = 64;
        let q = find_ntt_primes(60, n, 1, &[]).unwrap()[0];
        let table = NttTable::new(q, n).unwrap();
        let original: Vec<u64> = (0..n as u64).map(|i| i * 977 % q).collect();
        let mut work = original.clone();
        table.forward(&mut work);
        table.inverse(&mut work);
        assert_eq!(work, original);
    }
}
