use std::fmt;

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use crate::arith::centered;
use crate::context::{CkksContext, ContextId};
use crate::error::{LatticeError, LatticeResult};
use crate::keys::{PublicKey, SecretKey};
use crate::poly::RnsPoly;
use crate::sampling;

/// An RLWE ciphertext at `level` (holding `level + 1` limbs). The level is
/// the remaining noise budget: each multiplication consumes one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub(crate) context_id: ContextId,
    pub(crate) level: usize,
    pub(crate) scale: f64,
    pub(crate) components: Vec<RnsPoly>,
}

impl Ciphertext {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn components(&self) -> &[RnsPoly] {
        &self.components
    }

    /// Rebuilds a ciphertext from decoded parts, checking shape against the
    /// context.
    pub fn from_parts(
        ctx: &CkksContext,
        context_id: ContextId,
        level: usize,
        scale: f64,
        components: Vec<RnsPoly>,
    ) -> LatticeResult<Self> {
        ctx.ensure(context_id)?;
        if level > ctx.max_level() {
            return Err(LatticeError::Encoding("level above context depth"));
        }
        if !(2..=3).contains(&components.len()) {
            return Err(LatticeError::ComponentCount(components.len()));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(LatticeError::Encoding("scale must be positive"));
        }
        for component in &components {
            if component.limb_count() != level + 1
                || component.limbs().iter().any(|l| l.len() != ctx.ring_dimension())
            {
                return Err(LatticeError::Encoding("limb shape does not match context"));
            }
            for (limb, &q) in component.limbs().iter().zip(ctx.moduli()) {
                if limb.iter().any(|&c| c >= q) {
                    return Err(LatticeError::Encoding("coefficient not reduced"));
                }
            }
        }
        Ok(Self {
            context_id,
            level,
            scale,
            components,
        })
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("context", &self.context_id)
            .field("level", &self.level)
            .field("scale_log2", &self.scale.log2())
            .field("components", &self.components.len())
            .finish()
    }
}

pub fn encrypt<R: Rng + CryptoRng + ?Sized>(
    ctx: &CkksContext,
    public: &PublicKey,
    values: &[f64],
    rng: &mut R,
) -> LatticeResult<Ciphertext> {
    encrypt_at(ctx, public, values, ctx.default_scale(), rng)
}

/// Encrypts at the top level with an explicit scale.
pub fn encrypt_at<R: Rng + CryptoRng + ?Sized>(
    ctx: &CkksContext,
    public: &PublicKey,
    values: &[f64],
    scale: f64,
    rng: &mut R,
) -> LatticeResult<Ciphertext> {
    ctx.ensure(public.context_id())?;
    let level = ctx.max_level();
    let tables = ctx.tables(level);
    let n = ctx.ring_dimension();
    let message = RnsPoly::from_limbs(ctx.lift(&ctx.encode_coefficients(values, scale)?, level));
    let v = RnsPoly::from_signed(&sampling::ternary(n, rng), tables);
    let e0 = RnsPoly::from_signed(&sampling::gaussian(n, rng), tables);
    let e1 = RnsPoly::from_signed(&sampling::gaussian(n, rng), tables);
    let c0 = public
        .b
        .multiply(&v, tables)
        .add(&e0, tables)
        .add(&message, tables);
    let c1 = public.a.multiply(&v, tables).add(&e1, tables);
    Ok(Ciphertext {
        context_id: ctx.id(),
        level,
        scale,
        components: vec![c0, c1],
    })
}

/// Phase `c0 + c1*s (+ c2*s^2)` reduced modulo `q_0`, centred.
pub(crate) fn phase(ctx: &CkksContext, secret: &SecretKey, ct: &Ciphertext) -> Vec<i64> {
    let table = &ctx.tables(0)[..1];
    let q0 = ctx.modulus(0);
    let s = secret.to_rns(table);
    let mut acc = RnsPoly::from_limbs(vec![ct.components[0].limb(0).to_vec()]);
    let mut power = s.clone();
    for component in &ct.components[1..] {
        let c = RnsPoly::from_limbs(vec![component.limb(0).to_vec()]);
        acc = acc.add(&c.multiply(&power, table), table);
        power = power.multiply(&s, table);
    }
    acc.limb(0).iter().map(|&x| centered(x, q0)).collect()
}

/// Decrypts the first `batch_size` slots.
pub fn decrypt(ctx: &CkksContext, secret: &SecretKey, ct: &Ciphertext) -> LatticeResult<Vec<f64>> {
    ctx.ensure(secret.context_id())?;
    ctx.ensure(ct.context_id)?;
    let coeffs = phase(ctx, secret, ct);
    Ok(ctx.decode_coefficients(&coeffs, ct.scale, ctx.batch_size()))
}
