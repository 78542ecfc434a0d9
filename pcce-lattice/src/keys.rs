use std::collections::BTreeMap;
use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::arith::{add_mod, mul_mod, neg_mod, reduce_i64};
use crate::context::{CkksContext, ContextId};
use crate::error::LatticeResult;
use crate::ntt::NttTable;
use crate::poly::{automorphism_signed, divide_round, RnsPoly};
use crate::sampling;

/// Ternary secret key. Never serialized, never printed, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    #[zeroize(skip)]
    context_id: ContextId,
    coeffs: Vec<i64>,
}

impl SecretKey {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub(crate) fn coeffs(&self) -> &[i64] {
        &self.coeffs
    }

    pub(crate) fn to_rns(&self, tables: &[NttTable]) -> RnsPoly {
        RnsPoly::from_signed(&self.coeffs, tables)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("context", &self.context_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PublicKey {
    context_id: ContextId,
    pub(crate) b: RnsPoly,
    pub(crate) a: RnsPoly,
}

impl PublicKey {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("context", &self.context_id)
            .field("limbs", &self.b.limb_count())
            .finish()
    }
}

/// One key-switching component per RNS digit, stored in evaluation form
/// over `q_0..q_L` followed by the special prime.
#[derive(Clone, Serialize, Deserialize)]
struct KeyDigit {
    b: Vec<Vec<u64>>,
    a: Vec<Vec<u64>>,
}

/// Switches a polynomial multiplied by `s_from` into one under `s`. Built
/// once over the full chain; usable at every level because the gadget is
/// the CRT idempotent basis.
#[derive(Clone, Serialize, Deserialize)]
pub struct SwitchingKey {
    context_id: ContextId,
    digits: Vec<KeyDigit>,
}

impl SwitchingKey {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Returns `(r0, r1)` over `q_0..=q_level` with `r0 + r1*s ≈ d*s_from`.
    pub(crate) fn switch(
        &self,
        ctx: &CkksContext,
        d: &RnsPoly,
        level: usize,
    ) -> (RnsPoly, RnsPoly) {
        let tables = ctx.tables(level);
        let special_index = ctx.max_level() + 1;
        let targets: Vec<(&NttTable, usize)> = tables
            .iter()
            .enumerate()
            .map(|(k, t)| (t, k))
            .chain(std::iter::once((ctx.special_table(), special_index)))
            .collect();

        let accumulated: Vec<(Vec<u64>, Vec<u64>)> = targets
            .par_iter()
            .map(|&(table, key_index)| {
                let q = table.modulus();
                let n = ctx.ring_dimension();
                let mut acc_b = vec![0u64; n];
                let mut acc_a = vec![0u64; n];
                for (i, digit) in self.digits.iter().take(level + 1).enumerate() {
                    let mut x: Vec<u64> = d.limb(i).iter().map(|&v| v % q).collect();
                    table.forward(&mut x);
                    let kb = &digit.b[key_index];
                    let ka = &digit.a[key_index];
                    for idx in 0..n {
                        acc_b[idx] = add_mod(acc_b[idx], mul_mod(x[idx], kb[idx], q), q);
                        acc_a[idx] = add_mod(acc_a[idx], mul_mod(x[idx], ka[idx], q), q);
                    }
                }
                table.inverse(&mut acc_b);
                table.inverse(&mut acc_a);
                (acc_b, acc_a)
            })
            .collect();

        let (mut main_b, mut main_a): (Vec<Vec<u64>>, Vec<Vec<u64>>) =
            accumulated.into_iter().unzip();
        let special_b = main_b.pop().unwrap_or_default();
        let special_a = main_a.pop().unwrap_or_default();
        let inverses = ctx.special_inverse(level);
        let p = ctx.special_modulus();
        (
            RnsPoly::from_limbs(divide_round(&main_b, &special_b, p, &inverses, tables)),
            RnsPoly::from_limbs(divide_round(&main_a, &special_a, p, &inverses, tables)),
        )
    }
}

impl fmt::Debug for SwitchingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchingKey")
            .field("context", &self.context_id)
            .field("digits", &self.digits.len())
            .finish()
    }
}

/// Switching key for `s^2`, consumed by every ciphertext multiplication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelinearizationKey(pub(crate) SwitchingKey);

impl RelinearizationKey {
    pub fn context_id(&self) -> ContextId {
        self.0.context_id
    }
}

/// Switching keys for `s(X^g)` indexed by Galois element.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RotationKeys {
    keys: BTreeMap<usize, SwitchingKey>,
}

impl RotationKeys {
    pub(crate) fn get(&self, galois: usize) -> Option<&SwitchingKey> {
        self.keys.get(&galois)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn merge(&mut self, other: RotationKeys) {
        self.keys.extend(other.keys);
    }
}

/// Everything a single key holder produces for a context.
#[derive(Debug)]
pub struct KeySet {
    pub secret: SecretKey,
    pub public: PublicKey,
    pub relinearization: RelinearizationKey,
}

pub struct KeyGenerator<'a> {
    ctx: &'a CkksContext,
    rng: ChaCha20Rng,
}

impl<'a> KeyGenerator<'a> {
    pub fn new(ctx: &'a CkksContext) -> Self {
        Self {
            ctx,
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    pub fn with_seed(ctx: &'a CkksContext, seed: u64) -> Self {
        Self {
            ctx,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    pub fn secret_key(&mut self) -> SecretKey {
        SecretKey {
            context_id: self.ctx.id(),
            coeffs: sampling::ternary(self.ctx.ring_dimension(), &mut self.rng),
        }
    }

    pub fn public_key(&mut self, secret: &SecretKey) -> LatticeResult<PublicKey> {
        self.ctx.ensure(secret.context_id)?;
        let level = self.ctx.max_level();
        let tables = self.ctx.tables(level);
        let n = self.ctx.ring_dimension();
        let a = RnsPoly::from_limbs(
            tables
                .iter()
                .map(|t| sampling::uniform(n, t.modulus(), &mut self.rng))
                .collect(),
        );
        let e = RnsPoly::from_signed(&sampling::gaussian(n, &mut self.rng), tables);
        let s = secret.to_rns(tables);
        let b = e.sub(&a.multiply(&s, tables), tables);
        Ok(PublicKey {
            context_id: self.ctx.id(),
            b,
            a,
        })
    }

    pub fn relinearization_key(&mut self, secret: &SecretKey) -> LatticeResult<RelinearizationKey> {
        self.ctx.ensure(secret.context_id)?;
        let table = &self.ctx.tables(0)[0];
        let q0 = table.modulus();
        let s0: Vec<u64> = secret.coeffs.iter().map(|&c| reduce_i64(c, q0)).collect();
        let squared: Vec<i64> = table
            .multiply(&s0, &s0)
            .into_iter()
            .map(|x| crate::arith::centered(x, q0))
            .collect();
        let key = self.switching_key(secret, &squared);
        debug!(context = %self.ctx.id(), "relinearization key generated");
        Ok(RelinearizationKey(key))
    }

    /// Generates rotation keys for left rotations by each of `steps`.
    pub fn rotation_keys(&mut self, secret: &SecretKey, steps: &[usize]) -> LatticeResult<RotationKeys> {
        self.ctx.ensure(secret.context_id)?;
        let mut keys = BTreeMap::new();
        for &step in steps {
            let galois = self.ctx.galois_element(step);
            if galois == 1 || keys.contains_key(&galois) {
                continue;
            }
            let rotated = automorphism_signed(&secret.coeffs, galois);
            keys.insert(galois, self.switching_key(secret, &rotated));
        }
        debug!(context = %self.ctx.id(), count = keys.len(), "rotation keys generated");
        Ok(RotationKeys { keys })
    }

    /// Secret, public and relinearization keys in one pass.
    pub fn key_set(&mut self) -> LatticeResult<KeySet> {
        let secret = self.secret_key();
        let public = self.public_key(&secret)?;
        let relinearization = self.relinearization_key(&secret)?;
        Ok(KeySet {
            secret,
            public,
            relinearization,
        })
    }

    fn switching_key(&mut self, secret: &SecretKey, from: &[i64]) -> SwitchingKey {
        let ctx = self.ctx;
        let n = ctx.ring_dimension();
        let top = ctx.max_level();
        let tables: Vec<&NttTable> = ctx
            .tables(top)
            .iter()
            .chain(std::iter::once(ctx.special_table()))
            .collect();
        let to_eval = |coeffs: &[i64], table: &NttTable| {
            let mut limb: Vec<u64> = coeffs.iter().map(|&c| reduce_i64(c, table.modulus())).collect();
            table.forward(&mut limb);
            limb
        };
        let s_eval: Vec<Vec<u64>> = tables.iter().map(|t| to_eval(&secret.coeffs, t)).collect();
        let from_eval: Vec<Vec<u64>> = tables.iter().map(|t| to_eval(from, t)).collect();

        let mut digits = Vec::with_capacity(top + 1);
        for i in 0..=top {
            let error = sampling::gaussian(n, &mut self.rng);
            let mut b_limbs = Vec::with_capacity(tables.len());
            let mut a_limbs = Vec::with_capacity(tables.len());
            for (k, table) in tables.iter().enumerate() {
                let q = table.modulus();
                let a = sampling::uniform(n, q, &mut self.rng);
                let e = to_eval(&error, table);
                let gadget = if k == i { ctx.special_residue(i) } else { 0 };
                let b: Vec<u64> = (0..n)
                    .map(|idx| {
                        let mut v = add_mod(neg_mod(mul_mod(a[idx], s_eval[k][idx], q), q), e[idx], q);
                        if gadget != 0 {
                            v = add_mod(v, mul_mod(gadget, from_eval[k][idx], q), q);
                        }
                        v
                    })
                    .collect();
                b_limbs.push(b);
                a_limbs.push(a);
            }
            digits.push(KeyDigit {
                b: b_limbs,
                a: a_limbs,
            });
        }
        SwitchingKey {
            context_id: ctx.id(),
            digits,
        }
    }
}
