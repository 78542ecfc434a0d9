//! Polynomials in residue-number-system form, one coefficient vector per
//! modulus of the chain. All polynomials here are in coefficient form.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::arith::{add_mod, centered, mul_mod, neg_mod, reduce_i64, sub_mod};
use crate::ntt::NttTable;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[cfg_attr(test, derive(Debug))]
pub struct RnsPoly {
    limbs: Vec<Vec<u64>>,
}

impl RnsPoly {
    pub fn from_limbs(limbs: Vec<Vec<u64>>) -> Self {
        Self { limbs }
    }

    pub fn zero(ring_dimension: usize, limb_count: usize) -> Self {
        Self {
            limbs: vec![vec![0; ring_dimension]; limb_count],
        }
    }

    pub fn from_signed(coeffs: &[i64], tables: &[NttTable]) -> Self {
        Self {
            limbs: tables
                .iter()
                .map(|t| coeffs.iter().map(|&c| reduce_i64(c, t.modulus())).collect())
                .collect(),
        }
    }

    pub fn limb_count(&self) -> usize {
        self.limbs.len()
    }

    pub fn limbs(&self) -> &[Vec<u64>] {
        &self.limbs
    }

    pub fn limb(&self, index: usize) -> &[u64] {
        &self.limbs[index]
    }

    pub fn into_limbs(self) -> Vec<Vec<u64>> {
        self.limbs
    }

    /// Drops limbs above `limb_count` (modulus switching down the chain).
    pub fn truncate(&mut self, limb_count: usize) {
        self.limbs.truncate(limb_count);
    }

    pub fn add(&self, other: &Self, tables: &[NttTable]) -> Self {
        self.zip_with(other, tables, add_mod)
    }

    pub fn sub(&self, other: &Self, tables: &[NttTable]) -> Self {
        self.zip_with(other, tables, sub_mod)
    }

    pub fn neg(&self, tables: &[NttTable]) -> Self {
        Self {
            limbs: self
                .limbs
                .iter()
                .zip(tables)
                .map(|(limb, t)| limb.iter().map(|&x| neg_mod(x, t.modulus())).collect())
                .collect(),
        }
    }

    /// Multiplies limb `i` by `scalars[i]`.
    pub fn mul_scalars(&self, scalars: &[u64], tables: &[NttTable]) -> Self {
        Self {
            limbs: self
                .limbs
                .iter()
                .zip(scalars.iter().zip(tables))
                .map(|(limb, (&s, t))| limb.iter().map(|&x| mul_mod(x, s, t.modulus())).collect())
                .collect(),
        }
    }

    pub fn multiply(&self, other: &Self, tables: &[NttTable]) -> Self {
        let limbs = self
            .limbs
            .par_iter()
            .zip(other.limbs.par_iter())
            .zip(tables.par_iter())
            .map(|((a, b), t)| t.multiply(a, b))
            .collect();
        Self { limbs }
    }

    /// Applies `X -> X^galois` limb by limb.
    pub fn automorphism(&self, galois: usize, tables: &[NttTable]) -> Self {
        let limbs = self
            .limbs
            .iter()
            .zip(tables)
            .map(|(limb, t)| automorphism_limb(limb, galois, t.modulus()))
            .collect();
        Self { limbs }
    }

    /// Divides by the modulus of the last limb with rounding and removes it:
    /// `c_i <- (c_i - [c_last]) * q_last^{-1}`.
    pub fn divide_by_last(&self, last_modulus: u64, inverses: &[u64], tables: &[NttTable]) -> Self {
        let count = self.limbs.len() - 1;
        let last = &self.limbs[count];
        Self {
            limbs: divide_round(&self.limbs[..count], last, last_modulus, inverses, tables),
        }
    }

    fn zip_with(&self, other: &Self, tables: &[NttTable], op: fn(u64, u64, u64) -> u64) -> Self {
        Self {
            limbs: self
                .limbs
                .iter()
                .zip(&other.limbs)
                .zip(tables)
                .map(|((a, b), t)| {
                    let q = t.modulus();
                    a.iter().zip(b).map(|(&x, &y)| op(x, y, q)).collect()
                })
                .collect(),
        }
    }
}

/// Rounded division of `main` by the modulus carried in `last`.
pub(crate) fn divide_round(
    main: &[Vec<u64>],
    last: &[u64],
    last_modulus: u64,
    inverses: &[u64],
    tables: &[NttTable],
) -> Vec<Vec<u64>> {
    let lifted: Vec<i64> = last.iter().map(|&x| centered(x, last_modulus)).collect();
    main.par_iter()
        .zip(inverses.par_iter())
        .zip(tables.par_iter())
        .map(|((limb, &inv), t)| {
            let q = t.modulus();
            limb.iter()
                .zip(&lifted)
                .map(|(&c, &r)| mul_mod(sub_mod(c, reduce_i64(r, q), q), inv, q))
                .collect()
        })
        .collect()
}

pub(crate) fn automorphism_limb(limb: &[u64], galois: usize, q: u64) -> Vec<u64> {
    let n = limb.len();
    let two_n = 2 * n;
    let mut out = vec![0u64; n];
    for (i, &c) in limb.iter().enumerate() {
        let e = (i * galois) % two_n;
        if e >= n {
            out[e - n] = sub_mod(out[e - n], c, q);
        } else {
            out[e] = add_mod(out[e], c, q);
        }
    }
    out
}

pub(crate) fn automorphism_signed(coeffs: &[i64], galois: usize) -> Vec<i64> {
    let n = coeffs.len();
    let two_n = 2 * n;
    let mut out = vec![0i64; n];
    for (i, &c) in coeffs.iter().enumerate() {
        let e = (i * galois) % two_n;
        if e >= n {
            out[e - n] -= c;
        } else {
            out[e] += c;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::find_ntt_primes;

    fn tables(n: usize) -> Vec<NttTable> {
        find_ntt_primes(40, n, 2, &[])
            .unwrap()
            .into_iter()
            .map(|q| NttTable::new(q, n).unwrap())
            .collect()
    }

    #[test]
    fn signed_round_trip_through_limbs() {
        let t = tables(8);
        let p = RnsPoly::from_signed(&[1, -1, 2, 0, 0, 0, 0, -5], &t);
        let q0 = t[0].modulus();
        assert_eq!(p.limb(0)[1], q0 - 1);
        let back = p.add(&p.neg(&t), &t);
        assert_eq!(back, RnsPoly::zero(8, 2));
    }

    #[test]
    fn automorphism_by_one_is_identity_and_signs_wrap() {
        let t = tables(4);
        let p = RnsPoly::from_signed(&[0, 1, 0, 0], &t);
        assert_eq!(p.automorphism(1, &t), p);
        // X -> X^5: X^1 becomes X^5 = -X^1 in Z[X]/(X^4+1)
        let rotated = p.automorphism(5, &t);
        assert_eq!(rotated, RnsPoly::from_signed(&[0, -1, 0, 0], &t));
        assert_eq!(automorphism_signed(&[0, 1, 0, 0], 5), vec![0, -1, 0, 0]);
    }

    #[test]
    fn divide_by_last_rounds_exact_multiples() {
        let t = tables(4);
        let q1 = t[1].modulus();
        let coeffs = [3i64, -2, 0, 7];
        let scaled: Vec<i64> = coeffs.iter().map(|c| c * q1 as i64 / 4).collect();
        let p = RnsPoly::from_signed(&scaled, &t);
        let inv = crate::arith::inv_mod(q1 % t[0].modulus(), t[0].modulus()).unwrap();
        let divided = p.divide_by_last(q1, &[inv], &t[..1]);
        let q0 = t[0].modulus();
        let got: Vec<i64> = divided.limb(0).iter().map(|&x| centered(x, q0)).collect();
        for (g, c) in got.iter().zip(coeffs) {
            assert!((4 * g - c).abs() <= 4, "{g} vs {c}");
        }
    }
}
