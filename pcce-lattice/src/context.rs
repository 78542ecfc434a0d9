use std::f64::consts::PI;
use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arith::{find_ntt_primes, inv_mod, reduce_i128};
use crate::error::{LatticeError, LatticeResult};
use crate::ntt::NttTable;

pub const BASE_MODULUS_BITS: u32 = 60;
pub const SPECIAL_MODULUS_BITS: u32 = 61;
pub const MIN_SCALING_BITS: u32 = 20;
pub const MAX_SCALING_BITS: u32 = 50;
pub const MAX_DEPTH: usize = 12;
pub const MAX_RING_DIMENSION: usize = 1 << 16;

/// Scheme parameters for a CKKS context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CkksParameters {
    /// Number of rescaling primes, i.e. sequential multiplications supported.
    pub depth: usize,
    /// Bit size of every rescaling prime and of the default scale.
    pub scaling_bits: u32,
    /// Number of slots exposed to callers; must be a power of two.
    pub batch_size: usize,
    /// Lower bound on the ring dimension. The effective dimension is
    /// `max(2 * batch_size, min_ring_dimension)`.
    pub min_ring_dimension: usize,
}

impl Default for CkksParameters {
    fn default() -> Self {
        Self {
            depth: 3,
            scaling_bits: 40,
            batch_size: 8,
            min_ring_dimension: 8_192,
        }
    }
}

impl CkksParameters {
    pub fn new(depth: usize, scaling_bits: u32, batch_size: usize) -> Self {
        Self {
            depth,
            scaling_bits,
            batch_size,
            ..Self::default()
        }
    }

    pub fn with_min_ring_dimension(mut self, min_ring_dimension: usize) -> Self {
        self.min_ring_dimension = min_ring_dimension;
        self
    }

    pub fn ring_dimension(&self) -> usize {
        (2 * self.batch_size)
            .max(self.min_ring_dimension)
            .next_power_of_two()
    }

    pub fn validate(&self) -> LatticeResult<()> {
        if self.depth == 0 || self.depth > MAX_DEPTH {
            return Err(LatticeError::InvalidParameters(format!(
                "depth must be within 1..={MAX_DEPTH}"
            )));
        }
        if !(MIN_SCALING_BITS..=MAX_SCALING_BITS).contains(&self.scaling_bits) {
            return Err(LatticeError::InvalidParameters(format!(
                "scaling bits must be within {MIN_SCALING_BITS}..={MAX_SCALING_BITS}"
            )));
        }
        if self.batch_size == 0 || !self.batch_size.is_power_of_two() {
            return Err(LatticeError::InvalidParameters(
                "batch size must be a power of two".into(),
            ));
        }
        if self.min_ring_dimension < 4 || !self.min_ring_dimension.is_power_of_two() {
            return Err(LatticeError::InvalidParameters(
                "minimum ring dimension must be a power of two >= 4".into(),
            ));
        }
        if self.ring_dimension() > MAX_RING_DIMENSION {
            return Err(LatticeError::InvalidParameters(format!(
                "ring dimension exceeds {MAX_RING_DIMENSION}"
            )));
        }
        Ok(())
    }
}

/// Content-derived identifier every ciphertext and key is bound to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub [u8; 32]);

impl ContextId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.short())
    }
}

/// An immutable CKKS context: modulus chain, NTT tables and the slot
/// embedding. Shared read-only across threads.
pub struct CkksContext {
    id: ContextId,
    params: CkksParameters,
    ring_dimension: usize,
    moduli: Vec<u64>,
    special: u64,
    tables: Vec<NttTable>,
    special_table: NttTable,
    rotation_group: Vec<usize>,
    cos_table: Vec<f64>,
}

impl fmt::Debug for CkksContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CkksContext")
            .field("id", &self.id)
            .field("ring_dimension", &self.ring_dimension)
            .field("levels", &self.max_level())
            .field("scaling_bits", &self.params.scaling_bits)
            .finish()
    }
}

impl CkksContext {
    /// Builds a context with a fresh random nonce folded into its id, so two
    /// contexts with equal parameters never share ciphertexts.
    pub fn new(params: CkksParameters) -> LatticeResult<Self> {
        Self::with_nonce(params, rand::random())
    }

    pub fn with_nonce(params: CkksParameters, nonce: [u8; 16]) -> LatticeResult<Self> {
        params.validate()?;
        let n = params.ring_dimension();
        let base = find_ntt_primes(BASE_MODULUS_BITS, n, 1, &[])?;
        let scaling = find_ntt_primes(params.scaling_bits, n, params.depth, &base)?;
        let mut moduli = base;
        moduli.extend(scaling);
        let special = find_ntt_primes(SPECIAL_MODULUS_BITS, n, 1, &moduli)?[0];

        let tables = moduli
            .iter()
            .map(|&q| NttTable::new(q, n))
            .collect::<LatticeResult<Vec<_>>>()?;
        let special_table = NttTable::new(special, n)?;

        let two_n = 2 * n;
        let mut rotation_group = Vec::with_capacity(n / 2);
        let mut g = 1usize;
        for _ in 0..n / 2 {
            rotation_group.push(g);
            g = g * 5 % two_n;
        }
        let cos_table = (0..two_n)
            .map(|e| (PI * e as f64 / n as f64).cos())
            .collect();

        let mut hasher = Hasher::new();
        hasher.update(b"pcce/ckks-context");
        hasher.update(&(params.depth as u64).to_le_bytes());
        hasher.update(&params.scaling_bits.to_le_bytes());
        hasher.update(&(params.batch_size as u64).to_le_bytes());
        hasher.update(&(n as u64).to_le_bytes());
        for q in moduli.iter().chain(std::iter::once(&special)) {
            hasher.update(&q.to_le_bytes());
        }
        hasher.update(&nonce);
        let id = ContextId(*hasher.finalize().as_bytes());

        debug!(context = %id, ring_dimension = n, levels = params.depth, "ckks context ready");
        Ok(Self {
            id,
            params,
            ring_dimension: n,
            moduli,
            special,
            tables,
            special_table,
            rotation_group,
            cos_table,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn params(&self) -> &CkksParameters {
        &self.params
    }

    pub fn ring_dimension(&self) -> usize {
        self.ring_dimension
    }

    pub fn slot_count(&self) -> usize {
        self.ring_dimension / 2
    }

    pub fn batch_size(&self) -> usize {
        self.params.batch_size
    }

    /// Highest ciphertext level, equal to the multiplicative depth.
    pub fn max_level(&self) -> usize {
        self.moduli.len() - 1
    }

    pub fn default_scale(&self) -> f64 {
        2f64.powi(self.params.scaling_bits as i32)
    }

    pub fn moduli(&self) -> &[u64] {
        &self.moduli
    }

    pub fn modulus(&self, level: usize) -> u64 {
        self.moduli[level]
    }

    pub fn special_modulus(&self) -> u64 {
        self.special
    }

    /// NTT tables for `q_0..=q_level`.
    pub fn tables(&self, level: usize) -> &[NttTable] {
        &self.tables[..=level]
    }

    pub fn special_table(&self) -> &NttTable {
        &self.special_table
    }

    /// Largest plaintext magnitude that survives decryption at `scale`.
    pub fn headroom(&self, scale: f64) -> f64 {
        (self.moduli[0] / 2) as f64 / scale
    }

    pub(crate) fn ensure(&self, other: ContextId) -> LatticeResult<()> {
        if self.id != other {
            return Err(LatticeError::ContextMismatch {
                expected: self.id.short(),
                found: other.short(),
            });
        }
        Ok(())
    }

    /// Galois element `5^steps mod 2N` implementing a left rotation.
    pub fn galois_element(&self, steps: usize) -> usize {
        self.rotation_group[steps % self.slot_count()]
    }

    /// Canonical-embedding encode of real `values` into signed integer
    /// coefficients at `scale`.
    pub fn encode_coefficients(&self, values: &[f64], scale: f64) -> LatticeResult<Vec<i128>> {
        if values.len() > self.slot_count() {
            return Err(LatticeError::InvalidParameters(format!(
                "{} values exceed {} slots",
                values.len(),
                self.slot_count()
            )));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(LatticeError::InvalidParameters("scale must be positive".into()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(LatticeError::InvalidParameters("non-finite slot value".into()));
        }
        let n = self.ring_dimension;
        let two_n = 2 * n;
        let limit = self.headroom(1.0);
        let factor = 2.0 * scale / n as f64;
        let mut coeffs = Vec::with_capacity(n);
        for k in 0..n {
            let mut acc = 0.0;
            for (j, z) in values.iter().enumerate() {
                if *z != 0.0 {
                    acc += z * self.cos_table[(self.rotation_group[j] * k) % two_n];
                }
            }
            let c = (acc * factor).round();
            if c.abs() >= limit {
                return Err(LatticeError::InvalidParameters(
                    "value exceeds plaintext headroom at this scale".into(),
                ));
            }
            coeffs.push(c as i128);
        }
        Ok(coeffs)
    }

    /// Decodes the first `count` slots from centred coefficients.
    pub fn decode_coefficients(&self, coeffs: &[i64], scale: f64, count: usize) -> Vec<f64> {
        let n = self.ring_dimension;
        let two_n = 2 * n;
        (0..count.min(self.slot_count()))
            .map(|j| {
                let g = self.rotation_group[j];
                let acc: f64 = coeffs
                    .iter()
                    .enumerate()
                    .map(|(k, &c)| c as f64 * self.cos_table[(g * k) % two_n])
                    .sum();
                acc / scale
            })
            .collect()
    }

    /// Reduces wide coefficients into every limb of `q_0..=q_level`.
    pub(crate) fn lift(&self, coeffs: &[i128], level: usize) -> Vec<Vec<u64>> {
        self.moduli[..=level]
            .iter()
            .map(|&q| coeffs.iter().map(|&c| reduce_i128(c, q)).collect())
            .collect()
    }

    /// `q_level^{-1} mod q_i` for every `i < level`.
    pub(crate) fn rescale_factors(&self, level: usize) -> Vec<u64> {
        let q_l = self.moduli[level];
        self.moduli[..level]
            .iter()
            .map(|&q| inv_mod(q_l % q, q).unwrap_or(0))
            .collect()
    }

    /// `P^{-1} mod q_i` for `i <= level`.
    pub(crate) fn special_inverse(&self, level: usize) -> Vec<u64> {
        self.moduli[..=level]
            .iter()
            .map(|&q| inv_mod(self.special % q, q).unwrap_or(0))
            .collect()
    }

    /// `P mod q_i`, the gadget factor used inside switching keys.
    pub(crate) fn special_residue(&self, index: usize) -> u64 {
        self.special % self.moduli[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> CkksContext {
        CkksContext::new(CkksParameters::new(2, 30, 4).with_min_ring_dimension(32)).unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(CkksParameters::new(0, 40, 8).validate().is_err());
        assert!(CkksParameters::new(2, 40, 6).validate().is_err());
        assert!(CkksParameters::new(2, 19, 8).validate().is_err());
        assert!(CkksParameters::new(2, 51, 8).validate().is_err());
        assert!(CkksParameters::default().validate().is_ok());
    }

    #[test]
    fn ring_dimension_follows_batch() {
        let params = CkksParameters::new(1, 40, 64).with_min_ring_dimension(32);
        assert_eq!(params.ring_dimension(), 128);
        assert_eq!(CkksParameters::default().ring_dimension(), 8_192);
    }

    #[test]
    fn encode_decode_is_close() {
        let ctx = small();
        let values = [1.25, -3.5, 0.0, 42.0];
        let coeffs = ctx.encode_coefficients(&values, ctx.default_scale()).unwrap();
        let narrow: Vec<i64> = coeffs.iter().map(|&c| c as i64).collect();
        let decoded = ctx.decode_coefficients(&narrow, ctx.default_scale(), 4);
        for (a, b) in values.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn equal_parameters_yield_distinct_ids() {
        assert_ne!(small().id(), small().id());
    }

    #[test]
    fn moduli_are_distinct_and_sized() {
        let ctx = small();
        assert_eq!(ctx.moduli().len(), 3);
        assert!(ctx.modulus(0) > 1 << 59);
        assert!(ctx.special_modulus() > 1 << 60);
        assert!(!ctx.moduli().contains(&ctx.special_modulus()));
    }
}
