//! Homomorphic evaluation over ciphertexts of one context.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::trace;

use crate::arith::reduce_i64;
use crate::ciphertext::Ciphertext;
use crate::context::CkksContext;
use crate::error::{LatticeError, LatticeResult};
use crate::keys::{RelinearizationKey, RotationKeys};
use crate::poly::RnsPoly;

const SCALE_TOLERANCE: f64 = 1e-12;
const MAX_INTEGER_FACTOR: f64 = (1u64 << 61) as f64;

pub fn scales_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= a.max(b) * SCALE_TOLERANCE
}

/// Left-rotation steps `1, 2, 4, ..` covering every slot, as needed by
/// [`Evaluator::sum_slots`].
pub fn power_of_two_steps(slot_count: usize) -> Vec<usize> {
    let mut steps = Vec::new();
    let mut step = 1;
    while step < slot_count {
        steps.push(step);
        step <<= 1;
    }
    steps
}

#[derive(Clone)]
pub struct Evaluator {
    ctx: Arc<CkksContext>,
    relinearization: Option<Arc<RelinearizationKey>>,
    rotations: Option<Arc<RotationKeys>>,
}

impl Evaluator {
    pub fn new(ctx: Arc<CkksContext>) -> Self {
        Self {
            ctx,
            relinearization: None,
            rotations: None,
        }
    }

    pub fn with_relinearization_key(mut self, key: Arc<RelinearizationKey>) -> LatticeResult<Self> {
        self.ctx.ensure(key.context_id())?;
        self.relinearization = Some(key);
        Ok(self)
    }

    pub fn with_rotation_keys(mut self, keys: Arc<RotationKeys>) -> Self {
        self.rotations = Some(keys);
        self
    }

    pub fn context(&self) -> &Arc<CkksContext> {
        &self.ctx
    }

    fn check(&self, ct: &Ciphertext) -> LatticeResult<()> {
        self.ctx.ensure(ct.context_id)
    }

    /// Drops limbs until `ct` sits at `level`; the scale is unchanged.
    pub fn mod_drop(&self, ct: &Ciphertext, level: usize) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        if level > ct.level {
            return Err(LatticeError::InvalidParameters(format!(
                "cannot raise level {} to {level} without refresh",
                ct.level
            )));
        }
        let mut out = ct.clone();
        for component in &mut out.components {
            component.truncate(level + 1);
        }
        out.level = level;
        Ok(out)
    }

    fn align_levels(&self, a: &Ciphertext, b: &Ciphertext) -> LatticeResult<(Ciphertext, Ciphertext)> {
        self.check(a)?;
        self.check(b)?;
        let level = a.level.min(b.level);
        Ok((self.mod_drop(a, level)?, self.mod_drop(b, level)?))
    }

    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.combine(a, b, false)
    }

    pub fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.combine(a, b, true)
    }

    fn combine(&self, a: &Ciphertext, b: &Ciphertext, subtract: bool) -> LatticeResult<Ciphertext> {
        let (a, b) = self.align_levels(a, b)?;
        if scales_match(a.scale, b.scale) {
            return Ok(self.componentwise(&a, &b, subtract));
        }
        // Bring both operands to a common scale with integer factors, then
        // spend one level removing the surplus.
        let level = a.level;
        if level == 0 {
            return Err(LatticeError::LevelExhausted { level, required: 1 });
        }
        let q_l = self.ctx.modulus(level) as f64;
        let target = a.scale.min(b.scale) * q_l;
        let ka = (target / a.scale).round() as i64;
        let kb = (target / b.scale).round() as i64;
        trace!(level, "aligning mismatched scales");
        let mut left = self.multiply_integer(&a, ka)?;
        let mut right = self.multiply_integer(&b, kb)?;
        left.scale = target;
        right.scale = target;
        self.rescale(&self.componentwise(&left, &right, subtract))
    }

    fn componentwise(&self, a: &Ciphertext, b: &Ciphertext, subtract: bool) -> Ciphertext {
        let tables = self.ctx.tables(a.level);
        let len = a.components.len().max(b.components.len());
        let zero = RnsPoly::zero(self.ctx.ring_dimension(), a.level + 1);
        let components = (0..len)
            .map(|i| {
                let x = a.components.get(i).unwrap_or(&zero);
                let y = b.components.get(i).unwrap_or(&zero);
                if subtract {
                    x.sub(y, tables)
                } else {
                    x.add(y, tables)
                }
            })
            .collect();
        Ciphertext {
            context_id: a.context_id,
            level: a.level,
            scale: a.scale,
            components,
        }
    }

    pub fn negate(&self, ct: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        let tables = self.ctx.tables(ct.level);
        let mut out = ct.clone();
        out.components = ct.components.iter().map(|c| c.neg(tables)).collect();
        Ok(out)
    }

    /// Adds plaintext slot values encoded at the ciphertext's own scale.
    pub fn add_plain(&self, ct: &Ciphertext, values: &[f64]) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        let tables = self.ctx.tables(ct.level);
        let encoded = self.ctx.encode_coefficients(values, ct.scale)?;
        let plain = RnsPoly::from_limbs(self.ctx.lift(&encoded, ct.level));
        let mut out = ct.clone();
        out.components[0] = out.components[0].add(&plain, tables);
        Ok(out)
    }

    pub fn sub_plain(&self, ct: &Ciphertext, values: &[f64]) -> LatticeResult<Ciphertext> {
        let negated: Vec<f64> = values.iter().map(|v| -v).collect();
        self.add_plain(ct, &negated)
    }

    /// Scalar multiplication without consuming depth: the factor is folded
    /// into the scale and only the sign touches the polynomials.
    pub fn multiply_plain(&self, ct: &Ciphertext, scalar: f64) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        if !scalar.is_finite() {
            return Err(LatticeError::InvalidParameters("scalar must be finite".into()));
        }
        if scalar == 0.0 {
            let mut out = ct.clone();
            out.components = ct
                .components
                .iter()
                .map(|_| RnsPoly::zero(self.ctx.ring_dimension(), ct.level + 1))
                .collect();
            return Ok(out);
        }
        let mut out = if scalar < 0.0 { self.negate(ct)? } else { ct.clone() };
        out.scale = ct.scale / scalar.abs();
        Ok(out)
    }

    /// Exact multiplication by an integer; the scale is unchanged, so the
    /// encoded value grows by `factor`.
    pub fn multiply_integer(&self, ct: &Ciphertext, factor: i64) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        let tables = self.ctx.tables(ct.level);
        let scalars: Vec<u64> = tables.iter().map(|t| reduce_i64(factor, t.modulus())).collect();
        let mut out = ct.clone();
        out.components = ct
            .components
            .iter()
            .map(|c| c.mul_scalars(&scalars, tables))
            .collect();
        Ok(out)
    }

    /// Tensor, relinearize and rescale. Consumes exactly one level.
    pub fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> LatticeResult<Ciphertext> {
        let (a, b) = self.align_levels(a, b)?;
        if a.components.len() != 2 || b.components.len() != 2 {
            return Err(LatticeError::ComponentCount(
                a.components.len().max(b.components.len()),
            ));
        }
        let level = a.level;
        if level == 0 {
            return Err(LatticeError::LevelExhausted { level, required: 1 });
        }
        let tables = self.ctx.tables(level);
        let (a0, a1) = (&a.components[0], &a.components[1]);
        let (b0, b1) = (&b.components[0], &b.components[1]);
        let d0 = a0.multiply(b0, tables);
        let d1 = a0.multiply(b1, tables).add(&a1.multiply(b0, tables), tables);
        let d2 = a1.multiply(b1, tables);
        let tensor = Ciphertext {
            context_id: a.context_id,
            level,
            scale: a.scale * b.scale,
            components: vec![d0, d1, d2],
        };
        let relinearized = self.relinearize(&tensor)?;
        trace!(level, "ciphertext multiply");
        self.rescale(&relinearized)
    }

    pub fn square(&self, ct: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.multiply(ct, ct)
    }

    /// Folds a three-component ciphertext back to two components.
    pub fn relinearize(&self, ct: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        match ct.components.len() {
            2 => return Ok(ct.clone()),
            3 => {}
            other => return Err(LatticeError::ComponentCount(other)),
        }
        let key = self.relinearization.as_ref().ok_or_else(|| {
            LatticeError::InvalidParameters("relinearization key not loaded".into())
        })?;
        let tables = self.ctx.tables(ct.level);
        let (r0, r1) = key.0.switch(&self.ctx, &ct.components[2], ct.level);
        Ok(Ciphertext {
            context_id: ct.context_id,
            level: ct.level,
            scale: ct.scale,
            components: vec![
                ct.components[0].add(&r0, tables),
                ct.components[1].add(&r1, tables),
            ],
        })
    }

    /// Divides by `q_level` and drops to the next level.
    pub fn rescale(&self, ct: &Ciphertext) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        let level = ct.level;
        if level == 0 {
            return Err(LatticeError::LevelExhausted { level, required: 1 });
        }
        let q_l = self.ctx.modulus(level);
        let inverses = self.ctx.rescale_factors(level);
        let tables = self.ctx.tables(level - 1);
        let components = ct
            .components
            .iter()
            .map(|c| c.divide_by_last(q_l, &inverses, tables))
            .collect();
        Ok(Ciphertext {
            context_id: ct.context_id,
            level: level - 1,
            scale: ct.scale / q_l as f64,
            components,
        })
    }

    /// Rotates the slot vector left by `steps`.
    pub fn rotate(&self, ct: &Ciphertext, steps: usize) -> LatticeResult<Ciphertext> {
        self.check(ct)?;
        if ct.components.len() != 2 {
            return Err(LatticeError::ComponentCount(ct.components.len()));
        }
        let galois = self.ctx.galois_element(steps);
        if galois == 1 {
            return Ok(ct.clone());
        }
        let key = self
            .rotations
            .as_ref()
            .and_then(|keys| keys.get(galois))
            .ok_or(LatticeError::MissingRotationKey(steps))?;
        let tables = self.ctx.tables(ct.level);
        let c0 = ct.components[0].automorphism(galois, tables);
        let c1 = ct.components[1].automorphism(galois, tables);
        let (r0, r1) = key.switch(&self.ctx, &c1, ct.level);
        Ok(Ciphertext {
            context_id: ct.context_id,
            level: ct.level,
            scale: ct.scale,
            components: vec![c0.add(&r0, tables), r1],
        })
    }

    /// Leaves the sum of all slots in every slot.
    pub fn sum_slots(&self, ct: &Ciphertext) -> LatticeResult<Ciphertext> {
        let mut acc = ct.clone();
        for step in power_of_two_steps(self.ctx.slot_count()) {
            let rotated = self.rotate(&acc, step)?;
            acc = self.add(&acc, &rotated)?;
        }
        Ok(acc)
    }

    /// Pairwise (balanced) addition of equal-scale ciphertexts.
    pub fn tree_sum(&self, mut layer: Vec<Ciphertext>) -> LatticeResult<Ciphertext> {
        if layer.is_empty() {
            return Err(LatticeError::InvalidParameters("nothing to sum".into()));
        }
        while layer.len() > 1 {
            layer = layer
                .par_chunks(2)
                .map(|pair| match pair {
                    [a, b] => self.add(a, b),
                    rest => Ok(rest[0].clone()),
                })
                .collect::<LatticeResult<Vec<_>>>()?;
        }
        layer
            .pop()
            .ok_or_else(|| LatticeError::InvalidParameters("nothing to sum".into()))
    }

    /// `Σ w_i · ct_i` with a single rescale. Every term is multiplied by the
    /// integer `round(w_i · T / s_i)` so all terms share the scale `T`, the
    /// terms are summed as a balanced tree, and one level is spent returning
    /// to roughly the default scale.
    pub fn weighted_sum(&self, cts: &[Ciphertext], weights: &[f64]) -> LatticeResult<Ciphertext> {
        if cts.is_empty() || cts.len() != weights.len() {
            return Err(LatticeError::InvalidParameters(
                "weights must match ciphertexts one to one".into(),
            ));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(LatticeError::InvalidParameters("weights must be finite".into()));
        }
        for ct in cts {
            self.check(ct)?;
        }
        let level = cts.iter().map(|c| c.level).min().unwrap_or(0);
        if level == 0 {
            return Err(LatticeError::LevelExhausted { level, required: 1 });
        }
        let q_l = self.ctx.modulus(level) as f64;
        let mut target = self.ctx.default_scale() * q_l;
        for (ct, w) in cts.iter().zip(weights) {
            if *w != 0.0 {
                target = target.min(MAX_INTEGER_FACTOR * ct.scale / w.abs());
            }
        }
        let terms = cts
            .iter()
            .zip(weights)
            .map(|(ct, w)| {
                let dropped = self.mod_drop(ct, level)?;
                let factor = (w * target / ct.scale).round() as i64;
                let mut term = self.multiply_integer(&dropped, factor)?;
                term.scale = target;
                Ok(term)
            })
            .collect::<LatticeResult<Vec<_>>>()?;
        let sum = self.tree_sum(terms)?;
        self.rescale(&sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciphertext::{decrypt, encrypt};
    use crate::context::CkksParameters;
    use crate::keys::{KeyGenerator, KeySet};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn setup(depth: usize) -> (Evaluator, KeySet, ChaCha20Rng) {
        let ctx = Arc::new(
            CkksContext::new(CkksParameters::new(depth, 40, 8).with_min_ring_dimension(64)).unwrap(),
        );
        let keys = KeyGenerator::with_seed(&ctx, 11).key_set().unwrap();
        let eval = Evaluator::new(ctx)
            .with_relinearization_key(Arc::new(keys.relinearization.clone()))
            .unwrap();
        (eval, keys, ChaCha20Rng::seed_from_u64(5))
    }

    fn assert_close(got: &[f64], want: &[f64], tol: f64) {
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() <= tol * w.abs().max(1.0), "{g} vs {w}");
        }
    }

    #[test]
    fn multiplication_consumes_one_level() {
        let (eval, keys, mut rng) = setup(2);
        let ctx = eval.context().clone();
        let a = encrypt(&ctx, &keys.public, &[1.5, -2.0], &mut rng).unwrap();
        let b = encrypt(&ctx, &keys.public, &[4.0, 3.0], &mut rng).unwrap();
        let prod = eval.multiply(&a, &b).unwrap();
        assert_eq!(prod.level(), 1);
        assert_close(&decrypt(&ctx, &keys.secret, &prod).unwrap()[..2], &[6.0, -6.0], 1e-6);
    }

    #[test]
    fn multiply_at_level_zero_is_rejected() {
        let (eval, keys, mut rng) = setup(1);
        let ctx = eval.context().clone();
        let a = encrypt(&ctx, &keys.public, &[2.0], &mut rng).unwrap();
        let sq = eval.square(&a).unwrap();
        let err = eval.square(&sq).unwrap_err();
        assert_eq!(err, LatticeError::LevelExhausted { level: 0, required: 1 });
    }

    #[test]
    fn multiply_plain_keeps_level_and_handles_sign() {
        let (eval, keys, mut rng) = setup(1);
        let ctx = eval.context().clone();
        let a = encrypt(&ctx, &keys.public, &[10.0, 20.0], &mut rng).unwrap();
        let neg = eval.multiply_plain(&a, -0.25).unwrap();
        assert_eq!(neg.level(), a.level());
        assert_close(&decrypt(&ctx, &keys.secret, &neg).unwrap()[..2], &[-2.5, -5.0], 1e-6);
        let zero = eval.multiply_plain(&a, 0.0).unwrap();
        assert!(decrypt(&ctx, &keys.secret, &zero).unwrap().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn mismatched_scales_are_aligned() {
        let (eval, keys, mut rng) = setup(2);
        let ctx = eval.context().clone();
        let a = encrypt(&ctx, &keys.public, &[3.0], &mut rng).unwrap();
        let b = encrypt(&ctx, &keys.public, &[2.0], &mut rng).unwrap();
        let sq = eval.square(&a).unwrap();
        let third = eval.multiply_plain(&b, 1.0 / 3.0).unwrap();
        let sum = eval.add(&sq, &third).unwrap();
        assert_eq!(sum.level(), 0);
        assert_close(&decrypt(&ctx, &keys.secret, &sum).unwrap()[..1], &[9.0 + 2.0 / 3.0], 1e-6);
    }

    #[test]
    fn weighted_sum_uses_one_level() {
        let (eval, keys, mut rng) = setup(2);
        let ctx = eval.context().clone();
        let cts: Vec<_> = [70.0, 80.0, 90.0]
            .iter()
            .map(|v| encrypt(&ctx, &keys.public, &[*v], &mut rng).unwrap())
            .collect();
        let out = eval.weighted_sum(&cts, &[0.3, 0.3, 0.4]).unwrap();
        assert_eq!(out.level(), 1);
        assert_close(&decrypt(&ctx, &keys.secret, &out).unwrap()[..1], &[81.0], 1e-8);
    }

    #[test]
    fn rotation_and_slot_sum() {
        let (eval, keys, mut rng) = setup(1);
        let ctx = eval.context().clone();
        let steps = power_of_two_steps(ctx.slot_count());
        let rotations = KeyGenerator::with_seed(&ctx, 12)
            .rotation_keys(&keys.secret, &steps)
            .unwrap();
        let eval = eval.with_rotation_keys(Arc::new(rotations));
        let ct = encrypt(&ctx, &keys.public, &[1.0, 2.0, 3.0, 4.0], &mut rng).unwrap();
        let rotated = eval.rotate(&ct, 1).unwrap();
        assert_close(&decrypt(&ctx, &keys.secret, &rotated).unwrap()[..3], &[2.0, 3.0, 4.0], 1e-6);
        let total = eval.sum_slots(&ct).unwrap();
        assert_close(&decrypt(&ctx, &keys.secret, &total).unwrap()[..2], &[10.0, 10.0], 1e-6);
        assert!(matches!(
            eval.rotate(&ct, 3),
            Err(LatticeError::MissingRotationKey(3))
        ));
    }
}
