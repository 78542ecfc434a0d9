//! Word-sized modular arithmetic and NTT-friendly prime search.
//!
//! Every modulus in the chain stays below 2^62 so that the sum of two reduced
//! residues never overflows a `u64`.

use crate::error::{LatticeError, LatticeResult};

const MILLER_RABIN_BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

#[inline]
pub fn add_mod(a: u64, b: u64, q: u64) -> u64 {
    let sum = a + b;
    if sum >= q {
        sum - q
    } else {
        sum
    }
}

#[inline]
pub fn sub_mod(a: u64, b: u64, q: u64) -> u64 {
    if a >= b {
        a - b
    } else {
        a + q - b
    }
}

#[inline]
pub fn neg_mod(a: u64, q: u64) -> u64 {
    if a == 0 {
        0
    } else {
        q - a
    }
}

#[inline]
pub fn mul_mod(a: u64, b: u64, q: u64) -> u64 {
    ((a as u128 * b as u128) % q as u128) as u64
}

pub fn pow_mod(mut base: u64, mut exp: u64, q: u64) -> u64 {
    let mut acc = 1 % q;
    base %= q;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, q);
        }
        base = mul_mod(base, base, q);
        exp >>= 1;
    }
    acc
}

/// Inverse modulo a prime `q`; `None` when `a ≡ 0`.
pub fn inv_mod(a: u64, q: u64) -> Option<u64> {
    let a = a % q;
    if a == 0 {
        None
    } else {
        Some(pow_mod(a, q - 2, q))
    }
}

/// Maps a residue to its centred representative in `(-q/2, q/2]`.
#[inline]
pub fn centered(x: u64, q: u64) -> i64 {
    if x > q / 2 {
        x as i64 - q as i64
    } else {
        x as i64
    }
}

#[inline]
pub fn reduce_i64(v: i64, q: u64) -> u64 {
    v.rem_euclid(q as i64) as u64
}

/// Reduces a signed wide integer, used when lifting rounded plaintext
/// coefficients that may exceed 63 bits before reduction.
#[inline]
pub fn reduce_i128(v: i128, q: u64) -> u64 {
    v.rem_euclid(q as i128) as u64
}

pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in MILLER_RABIN_BASES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    'witness: for a in MILLER_RABIN_BASES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Finds `count` primes `q ≡ 1 (mod 2N)` strictly below `2^bits`, searching
/// downwards and skipping anything listed in `exclude`.
pub fn find_ntt_primes(
    bits: u32,
    ring_dimension: usize,
    count: usize,
    exclude: &[u64],
) -> LatticeResult<Vec<u64>> {
    if !(20..=61).contains(&bits) {
        return Err(LatticeError::InvalidParameters(format!(
            "prime size {bits} outside supported range 20..=61"
        )));
    }
    let m = 2 * ring_dimension as u64;
    let upper = 1u64 << bits;
    let lower = 1u64 << (bits - 1);
    let mut k = (upper - 1) / m;
    let mut found = Vec::with_capacity(count);
    while found.len() < count {
        if k == 0 {
            break;
        }
        let candidate = k * m + 1;
        if candidate <= lower {
            break;
        }
        if candidate < upper && is_prime(candidate) && !exclude.contains(&candidate) {
            found.push(candidate);
        }
        k -= 1;
    }
    if found.len() < count {
        return Err(LatticeError::PrimeSearchExhausted {
            bits,
            ring_dimension,
        });
    }
    Ok(found)
}

/// Smallest-generator primitive 2N-th root of unity modulo `q`.
pub fn primitive_root_2n(q: u64, ring_dimension: usize) -> LatticeResult<u64> {
    let two_n = 2 * ring_dimension as u64;
    if (q - 1) % two_n != 0 {
        return Err(LatticeError::InvalidParameters(format!(
            "modulus is not congruent to 1 mod {two_n}"
        )));
    }
    for g in 2..q.min(1 << 20) {
        let psi = pow_mod(g, (q - 1) / two_n, q);
        if pow_mod(psi, ring_dimension as u64, q) == q - 1 {
            return Ok(psi);
        }
    }
    Err(LatticeError::InvalidParameters(
        "no primitive root of unity found".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miller_rabin_matches_known_values() {
        assert!(is_prime(2));
        assert!(is_prime(65_537));
        assert!(is_prime((1u64 << 61) - 1));
        assert!(!is_prime(1));
        assert!(!is_prime(3_215_031_751));
        assert!(!is_prime(65_537 * 65_539));
    }

    #[test]
    fn ntt_primes_are_congruent_and_distinct() {
        let primes = find_ntt_primes(40, 1024, 3, &[]).unwrap();
        assert_eq!(primes.len(), 3);
        for q in &primes {
            assert_eq!((q - 1) % 2048, 0);
            assert!(*q < 1 << 40 && *q > 1 << 39);
        }
        let more = find_ntt_primes(40, 1024, 1, &primes).unwrap();
        assert!(!primes.contains(&more[0]));
    }

    #[test]
    fn root_has_exact_order() {
        let q = find_ntt_primes(50, 64, 1, &[]).unwrap()[0];
        let psi = primitive_root_2n(q, 64).unwrap();
        assert_eq!(pow_mod(psi, 128, q), 1);
        assert_eq!(pow_mod(psi, 64, q), q - 1);
    }

    #[test]
    fn inverse_and_centering() {
        let q = 97;
        assert_eq!(mul_mod(inv_mod(13, q).unwrap(), 13, q), 1);
        assert_eq!(inv_mod(0, q), None);
        assert_eq!(centered(96, q), -1);
        assert_eq!(reduce_i64(-1, q), 96);
    }
}
