//! (t, n) threshold decryption over a Shamir-shared CKKS secret.
//!
//! A dealer samples the secret, publishes the public and relinearization
//! keys, and splits `s mod q_0` coefficient-wise into `n` shares before the
//! secret is wiped. Any roster of `t` share holders can jointly decrypt a
//! two-component ciphertext; each partial carries its own Lagrange weight
//! and smudging noise, so partials never expose a share and never decrypt
//! anything on their own.

use std::collections::BTreeSet;
use std::fmt;

use blake3::Hasher;
use rand::{CryptoRng, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::arith::{add_mod, centered, inv_mod, mul_mod, reduce_i64, sub_mod};
use crate::ciphertext::Ciphertext;
use crate::context::{CkksContext, ContextId};
use crate::error::{LatticeError, LatticeResult};
use crate::keys::{KeyGenerator, PublicKey, RelinearizationKey};
use crate::sampling;

/// Bit size of the uniform noise added to every partial decryption.
pub const SMUDGING_BITS: u32 = 16;

/// Describes how many of the `n` shares are required to decrypt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// Minimum number of shares that must cooperate.
    pub t: u8,
    /// Total number of shares issued.
    pub n: u8,
}

impl ThresholdPolicy {
    pub fn new(t: u8, n: u8) -> LatticeResult<Self> {
        let policy = Self { t, n };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> LatticeResult<()> {
        if self.t == 0 || self.n == 0 {
            return Err(LatticeError::Threshold(
                "threshold parameters must be non-zero".into(),
            ));
        }
        if self.t > self.n {
            return Err(LatticeError::Threshold(
                "threshold minimum cannot exceed share count".into(),
            ));
        }
        Ok(())
    }
}

/// One participant's share of the secret key modulo `q_0`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    #[zeroize(skip)]
    context_id: ContextId,
    #[zeroize(skip)]
    index: u8,
    #[zeroize(skip)]
    policy: ThresholdPolicy,
    #[zeroize(skip)]
    commitment: [u8; 32],
    coeffs: Vec<u64>,
}

impl KeyShare {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Public commitment to this share, published by the dealer.
    pub fn commitment(&self) -> [u8; 32] {
        self.commitment
    }

    pub fn verify_commitment(&self) -> bool {
        share_commitment(&self.context_id, self.index, &self.coeffs) == self.commitment
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("context", &self.context_id)
            .field("index", &self.index)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn share_commitment(context_id: &ContextId, index: u8, coeffs: &[u64]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(b"pcce/key-share");
    hasher.update(context_id.as_bytes());
    hasher.update(&[index]);
    for c in coeffs {
        hasher.update(&c.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Output of a dealer run. The secret key itself is gone by the time this
/// value exists.
#[derive(Debug)]
pub struct ThresholdKeySet {
    pub policy: ThresholdPolicy,
    pub public: PublicKey,
    pub relinearization: RelinearizationKey,
    pub shares: Vec<KeyShare>,
}

impl ThresholdKeySet {
    /// Public commitments in share-index order.
    pub fn commitments(&self) -> Vec<(u8, [u8; 32])> {
        self.shares.iter().map(|s| (s.index, s.commitment)).collect()
    }
}

pub struct ThresholdDealer<'a> {
    ctx: &'a CkksContext,
    seed: Option<u64>,
}

impl<'a> ThresholdDealer<'a> {
    pub fn new(ctx: &'a CkksContext) -> Self {
        Self { ctx, seed: None }
    }

    pub fn with_seed(ctx: &'a CkksContext, seed: u64) -> Self {
        Self {
            ctx,
            seed: Some(seed),
        }
    }

    pub fn deal(&self, policy: ThresholdPolicy) -> LatticeResult<ThresholdKeySet> {
        policy.validate()?;
        let (mut generator, mut rng) = match self.seed {
            Some(seed) => (
                KeyGenerator::with_seed(self.ctx, seed),
                ChaCha20Rng::seed_from_u64(seed ^ 0x5eed_5a4e),
            ),
            None => (KeyGenerator::new(self.ctx), ChaCha20Rng::from_entropy()),
        };
        let secret = generator.secret_key();
        let public = generator.public_key(&secret)?;
        let relinearization = generator.relinearization_key(&secret)?;

        let q0 = self.ctx.modulus(0);
        let n = self.ctx.ring_dimension();
        let degree = policy.t as usize - 1;
        let mut polynomial: Zeroizing<Vec<u64>> = Zeroizing::new(Vec::with_capacity(n * degree));
        for _ in 0..n * degree {
            polynomial.push(rng.gen_range(0..q0));
        }

        let mut shares = Vec::with_capacity(policy.n as usize);
        for index in 1..=policy.n {
            let x = index as u64;
            let coeffs: Vec<u64> = secret
                .coeffs()
                .iter()
                .enumerate()
                .map(|(k, &s)| {
                    // Horner over the degree-(t-1) polynomial for coefficient k.
                    let mut acc = 0u64;
                    for d in (0..degree).rev() {
                        acc = add_mod(mul_mod(acc, x, q0), polynomial[k * degree + d], q0);
                    }
                    add_mod(mul_mod(acc, x, q0), reduce_i64(s, q0), q0)
                })
                .collect();
            let commitment = share_commitment(&self.ctx.id(), index, &coeffs);
            shares.push(KeyShare {
                context_id: self.ctx.id(),
                index,
                policy,
                commitment,
                coeffs,
            });
        }
        drop(secret);
        info!(context = %self.ctx.id(), t = policy.t, n = policy.n, "threshold keys dealt");
        Ok(ThresholdKeySet {
            policy,
            public,
            relinearization,
            shares,
        })
    }
}

/// Lagrange coefficient at zero for `index` over `roster`, modulo `q`.
pub fn lagrange_at_zero(index: u8, roster: &[u8], q: u64) -> LatticeResult<u64> {
    let j = index as u64;
    let mut num = 1u64;
    let mut den = 1u64;
    for &m in roster {
        if m == index {
            continue;
        }
        let m = m as u64;
        num = mul_mod(num, m, q);
        den = mul_mod(den, sub_mod(m, j, q), q);
    }
    let inv = inv_mod(den, q)
        .ok_or_else(|| LatticeError::Threshold("degenerate roster".into()))?;
    Ok(mul_mod(num, inv, q))
}

/// Binding digest of the parts of a ciphertext a partial decryption uses.
pub fn ciphertext_digest(ct: &Ciphertext) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(b"pcce/partial-target");
    hasher.update(ct.context_id().as_bytes());
    hasher.update(&(ct.level() as u64).to_le_bytes());
    hasher.update(&ct.scale().to_le_bytes());
    for component in ct.components() {
        for c in component.limb(0) {
            hasher.update(&c.to_le_bytes());
        }
    }
    *hasher.finalize().as_bytes()
}

/// A participant's contribution towards decrypting one ciphertext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDecryption {
    pub participant: u8,
    pub roster: Vec<u8>,
    pub target: [u8; 32],
    values: Vec<u64>,
}

impl fmt::Debug for PartialDecryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialDecryption")
            .field("participant", &self.participant)
            .field("roster", &self.roster)
            .finish_non_exhaustive()
    }
}

fn normalized_roster(roster: &[u8]) -> LatticeResult<Vec<u8>> {
    let set: BTreeSet<u8> = roster.iter().copied().collect();
    if set.len() != roster.len() || set.contains(&0) {
        return Err(LatticeError::Threshold(
            "roster must contain distinct non-zero indices".into(),
        ));
    }
    Ok(set.into_iter().collect())
}

/// Computes `λ_j · c1 · s_j + e_smudge (mod q_0)` for the given roster.
pub fn partial_decrypt<R: Rng + CryptoRng + ?Sized>(
    ctx: &CkksContext,
    share: &KeyShare,
    ct: &Ciphertext,
    roster: &[u8],
    rng: &mut R,
) -> LatticeResult<PartialDecryption> {
    ctx.ensure(share.context_id)?;
    ctx.ensure(ct.context_id())?;
    if ct.components().len() != 2 {
        return Err(LatticeError::ComponentCount(ct.components().len()));
    }
    if !share.verify_commitment() {
        return Err(LatticeError::Threshold("share commitment mismatch".into()));
    }
    let roster = normalized_roster(roster)?;
    if !roster.contains(&share.index) {
        return Err(LatticeError::Threshold("participant not on roster".into()));
    }
    let table = &ctx.tables(0)[0];
    let q0 = table.modulus();
    let lambda = lagrange_at_zero(share.index, &roster, q0)?;
    let weighted: Zeroizing<Vec<u64>> =
        Zeroizing::new(share.coeffs.iter().map(|&c| mul_mod(c, lambda, q0)).collect());
    let product = table.multiply(ct.components()[1].limb(0), &weighted);
    let noise = sampling::bounded(ctx.ring_dimension(), 1i64 << SMUDGING_BITS, rng);
    let values = product
        .iter()
        .zip(&noise)
        .map(|(&p, &e)| add_mod(p, reduce_i64(e, q0), q0))
        .collect();
    Ok(PartialDecryption {
        participant: share.index,
        roster,
        target: ciphertext_digest(ct),
        values,
    })
}

fn accumulate(ctx: &CkksContext, ct: &Ciphertext, partials: &[PartialDecryption]) -> Vec<i64> {
    let q0 = ctx.modulus(0);
    let mut acc = ct.components()[0].limb(0).to_vec();
    for partial in partials {
        for (a, &v) in acc.iter_mut().zip(&partial.values) {
            *a = add_mod(*a, v, q0);
        }
    }
    acc.into_iter().map(|x| centered(x, q0)).collect()
}

/// Combines exactly one partial from every roster member into the
/// plaintext slots.
pub fn combine(
    ctx: &CkksContext,
    ct: &Ciphertext,
    partials: &[PartialDecryption],
    policy: ThresholdPolicy,
) -> LatticeResult<Vec<f64>> {
    ctx.ensure(ct.context_id())?;
    policy.validate()?;
    let first = partials
        .first()
        .ok_or_else(|| LatticeError::Threshold("no partial decryptions".into()))?;
    if first.roster.len() < policy.t as usize {
        return Err(LatticeError::Threshold(format!(
            "roster of {} is below threshold {}",
            first.roster.len(),
            policy.t
        )));
    }
    let target = ciphertext_digest(ct);
    let contributors: BTreeSet<u8> = partials.iter().map(|p| p.participant).collect();
    if contributors.len() != partials.len() {
        return Err(LatticeError::Threshold("duplicate partial decryption".into()));
    }
    for partial in partials {
        if partial.roster != first.roster || partial.target != target {
            return Err(LatticeError::Threshold(
                "partials disagree on roster or ciphertext".into(),
            ));
        }
        if partial.values.len() != ctx.ring_dimension() {
            return Err(LatticeError::Encoding("partial length mismatch"));
        }
    }
    if contributors.iter().copied().collect::<Vec<_>>() != first.roster {
        return Err(LatticeError::Threshold(
            "every roster member must contribute".into(),
        ));
    }
    let coeffs = accumulate(ctx, ct, partials);
    Ok(ctx.decode_coefficients(&coeffs, ct.scale(), ctx.batch_size()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciphertext::encrypt;
    use crate::context::CkksParameters;

    fn setup() -> (CkksContext, ThresholdKeySet, ChaCha20Rng) {
        let ctx = CkksContext::new(CkksParameters::new(1, 40, 4).with_min_ring_dimension(64)).unwrap();
        let keys = ThresholdDealer::with_seed(&ctx, 9)
            .deal(ThresholdPolicy::new(3, 5).unwrap())
            .unwrap();
        (ctx, keys, ChaCha20Rng::seed_from_u64(10))
    }

    #[test]
    fn rejects_invalid_policies() {
        assert!(ThresholdPolicy::new(0, 3).is_err());
        assert!(ThresholdPolicy::new(4, 3).is_err());
        assert!(ThresholdPolicy::new(3, 3).is_ok());
    }

    #[test]
    fn any_three_of_five_recover_the_plaintext() {
        let (ctx, keys, mut rng) = setup();
        let ct = encrypt(&ctx, &keys.public, &[12.5, -3.0], &mut rng).unwrap();
        for roster in [[1u8, 2, 3], [1, 3, 5], [2, 4, 5]] {
            let partials: Vec<_> = roster
                .iter()
                .map(|&i| {
                    partial_decrypt(&ctx, &keys.shares[i as usize - 1], &ct, &roster, &mut rng)
                        .unwrap()
                })
                .collect();
            let out = combine(&ctx, &ct, &partials, keys.policy).unwrap();
            assert!((out[0] - 12.5).abs() < 1e-4);
            assert!((out[1] + 3.0).abs() < 1e-4);
        }
    }

    #[test]
    fn two_shares_decode_to_noise() {
        let (ctx, keys, mut rng) = setup();
        let ct = encrypt(&ctx, &keys.public, &[12.5], &mut rng).unwrap();
        let roster = [2u8, 4];
        let partials: Vec<_> = roster
            .iter()
            .map(|&i| partial_decrypt(&ctx, &keys.shares[i as usize - 1], &ct, &roster, &mut rng).unwrap())
            .collect();
        assert!(combine(&ctx, &ct, &partials, keys.policy).is_err());
        let coeffs = accumulate(&ctx, &ct, &partials);
        let decoded = ctx.decode_coefficients(&coeffs, ct.scale(), 1);
        assert!((decoded[0] - 12.5).abs() > 1.0);
        // Coefficients spread across the whole of Z_q0, unlike a real phase.
        let q0 = ctx.modulus(0) as f64;
        let large = coeffs.iter().filter(|c| (**c as f64).abs() > q0 / 8.0).count();
        assert!(large > coeffs.len() / 2);
    }

    #[test]
    fn tampered_share_is_refused() {
        let (ctx, keys, mut rng) = setup();
        let ct = encrypt(&ctx, &keys.public, &[1.0], &mut rng).unwrap();
        let mut share = keys.shares[0].clone();
        share.coeffs[0] ^= 1;
        let err = partial_decrypt(&ctx, &share, &ct, &[1, 2, 3], &mut rng).unwrap_err();
        assert!(matches!(err, LatticeError::Threshold(_)));
    }

    #[test]
    fn partials_are_bound_to_their_ciphertext() {
        let (ctx, keys, mut rng) = setup();
        let a = encrypt(&ctx, &keys.public, &[1.0], &mut rng).unwrap();
        let b = encrypt(&ctx, &keys.public, &[2.0], &mut rng).unwrap();
        let roster = [1u8, 2, 3];
        let mut partials: Vec<_> = roster[..2]
            .iter()
            .map(|&i| partial_decrypt(&ctx, &keys.shares[i as usize - 1], &a, &roster, &mut rng).unwrap())
            .collect();
        partials.push(partial_decrypt(&ctx, &keys.shares[2], &b, &roster, &mut rng).unwrap());
        assert!(combine(&ctx, &a, &partials, keys.policy).is_err());
    }
}
