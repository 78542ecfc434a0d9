//! Encryption context manager: scheme parameters and key lifecycle.

use std::sync::Arc;

use pcce_lattice::{
    power_of_two_steps, Ciphertext, CkksContext, CkksParameters, KeyGenerator, KeyShare, PublicKey,
    RelinearizationKey, RotationKeys, SecretKey, ThresholdDealer, ThresholdPolicy,
};
use pcce_telemetry::{names, TelemetryHandle};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::refresh::Refresher;

/// Key material anyone may hold: encryption, relinearization and rotation
/// keys, all bound to one context.
#[derive(Clone, Debug)]
pub struct PublicMaterial {
    pub context: Arc<CkksContext>,
    pub public: Arc<PublicKey>,
    pub relinearization: Arc<RelinearizationKey>,
    pub rotations: Arc<RotationKeys>,
}

/// Single-owner key pair.
#[derive(Debug)]
pub struct KeyMaterial {
    pub public: PublicMaterial,
    pub secret: Arc<SecretKey>,
}

/// Dealer output for a `(t, n)` deployment. Each share is meant to be moved
/// to its participant and dropped here.
#[derive(Debug)]
pub struct ThresholdKeyMaterial {
    pub public: PublicMaterial,
    pub policy: ThresholdPolicy,
    pub shares: Vec<KeyShare>,
}

impl ThresholdKeyMaterial {
    pub fn commitments(&self) -> Vec<(u8, [u8; 32])> {
        self.shares.iter().map(|s| (s.index(), s.commitment())).collect()
    }
}

/// Independent seed for one use of a deployment seed, so seeded runs never
/// share a random stream between keys, dealers and protocol randomness.
pub fn derive_seed(seed: u64, label: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pcce/seed/");
    hasher.update(label.as_bytes());
    hasher.update(&seed.to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

#[derive(Clone, Default)]
pub struct ContextManager {
    min_ring_dimension: Option<usize>,
    seed: Option<u64>,
    telemetry: TelemetryHandle,
}

impl ContextManager {
    pub fn new(telemetry: TelemetryHandle) -> Self {
        Self {
            min_ring_dimension: None,
            seed: None,
            telemetry,
        }
    }

    /// Lower bound on the ring dimension; tests use small rings.
    pub fn with_min_ring_dimension(mut self, min_ring_dimension: usize) -> Self {
        self.min_ring_dimension = Some(min_ring_dimension);
        self
    }

    /// Deterministic key generation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn create_context(
        &self,
        depth: usize,
        scaling_bits: u32,
        batch_size: usize,
    ) -> EngineResult<Arc<CkksContext>> {
        if depth < 1 {
            return Err(EngineError::InvalidParameters(
                "multiplicative depth must be at least 1".into(),
            ));
        }
        if batch_size == 0 || !batch_size.is_power_of_two() {
            return Err(EngineError::InvalidParameters(format!(
                "batch size {batch_size} is not a power of two"
            )));
        }
        let mut params = CkksParameters::new(depth, scaling_bits, batch_size);
        if let Some(min) = self.min_ring_dimension {
            params = params.with_min_ring_dimension(min);
        }
        self.create_from(params)
    }

    pub fn create_from(&self, params: CkksParameters) -> EngineResult<Arc<CkksContext>> {
        let ctx = CkksContext::new(params)?;
        info!(
            context = %ctx.id(),
            depth = ctx.max_level(),
            ring_dimension = ctx.ring_dimension(),
            slots = ctx.batch_size(),
            "encryption context created"
        );
        Ok(Arc::new(ctx))
    }

    fn generator<'a>(&self, ctx: &'a CkksContext) -> KeyGenerator<'a> {
        match self.seed {
            Some(seed) => KeyGenerator::with_seed(ctx, seed),
            None => KeyGenerator::new(ctx),
        }
    }

    /// Standard key pair plus the rotation keys needed to fold the batch.
    pub fn generate_keys(&self, ctx: &Arc<CkksContext>) -> EngineResult<KeyMaterial> {
        let mut generator = self.generator(ctx);
        let keys = generator.key_set()?;
        let rotations = generator.rotation_keys(&keys.secret, &power_of_two_steps(ctx.batch_size()))?;
        info!(context = %ctx.id(), rotations = rotations.len(), "key pair generated");
        Ok(KeyMaterial {
            public: PublicMaterial {
                context: ctx.clone(),
                public: Arc::new(keys.public),
                relinearization: Arc::new(keys.relinearization),
                rotations: Arc::new(rotations),
            },
            secret: Arc::new(keys.secret),
        })
    }

    /// Rotation keys for additional steps, merged into `keys`.
    pub fn generate_rotation_keys(&self, keys: &mut KeyMaterial, steps: &[usize]) -> EngineResult<()> {
        let ctx = keys.public.context.clone();
        let extra = self.generator(&ctx).rotation_keys(&keys.secret, steps)?;
        let mut merged = (*keys.public.rotations).clone();
        merged.merge(extra);
        keys.public.rotations = Arc::new(merged);
        Ok(())
    }

    pub fn generate_threshold_keys(
        &self,
        ctx: &Arc<CkksContext>,
        n: usize,
        t: usize,
    ) -> EngineResult<ThresholdKeyMaterial> {
        if t < 1 || t > n || n > u8::MAX as usize {
            return Err(EngineError::InvalidThreshold { t, n });
        }
        let policy = ThresholdPolicy::new(t as u8, n as u8)
            .map_err(|_| EngineError::InvalidThreshold { t, n })?;
        let dealer = match self.seed {
            Some(seed) => ThresholdDealer::with_seed(ctx, derive_seed(seed, "threshold")),
            None => ThresholdDealer::new(ctx),
        };
        let dealt = dealer.deal(policy)?;
        Ok(ThresholdKeyMaterial {
            public: PublicMaterial {
                context: ctx.clone(),
                public: Arc::new(dealt.public),
                relinearization: Arc::new(dealt.relinearization),
                rotations: Arc::new(RotationKeys::default()),
            },
            policy,
            shares: dealt.shares,
        })
    }

    /// Restores the noise budget of `ct` through `refresher`.
    pub fn refresh(
        &self,
        ctx: &CkksContext,
        refresher: &dyn Refresher,
        ct: &Ciphertext,
    ) -> EngineResult<Ciphertext> {
        ensure_context(ctx, ct)?;
        warn!(context = %ctx.id(), level = ct.level(), "refreshing exhausted ciphertext");
        let fresh = refresher.refresh(ct)?;
        self.telemetry.incr(names::CKKS_REFRESH);
        Ok(fresh)
    }
}

pub(crate) fn ensure_context(ctx: &CkksContext, ct: &Ciphertext) -> EngineResult<()> {
    if ct.context_id() != ctx.id() {
        return Err(EngineError::ContextMismatch {
            expected: ctx.id().short(),
            found: ct.context_id().short(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcce_lattice::{decrypt, encrypt};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn manager() -> ContextManager {
        ContextManager::default().with_min_ring_dimension(64).with_seed(7)
    }

    #[test]
    fn validates_context_parameters() {
        let manager = manager();
        assert!(matches!(
            manager.create_context(0, 40, 8),
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(matches!(
            manager.create_context(2, 40, 12),
            Err(EngineError::InvalidParameters(_))
        ));
        let ctx = manager.create_context(2, 40, 8).unwrap();
        assert_eq!(ctx.max_level(), 2);
        assert_eq!(ctx.batch_size(), 8);
    }

    #[test]
    fn rejects_impossible_thresholds() {
        let manager = manager();
        let ctx = manager.create_context(1, 40, 4).unwrap();
        assert!(matches!(
            manager.generate_threshold_keys(&ctx, 3, 4),
            Err(EngineError::InvalidThreshold { t: 4, n: 3 })
        ));
        assert!(matches!(
            manager.generate_threshold_keys(&ctx, 3, 0),
            Err(EngineError::InvalidThreshold { t: 0, n: 3 })
        ));
        let material = manager.generate_threshold_keys(&ctx, 5, 3).unwrap();
        assert_eq!(material.shares.len(), 5);
        assert_eq!(material.commitments().len(), 5);
    }

    #[test]
    fn owner_key_cannot_open_threshold_ciphertexts() {
        let manager = manager();
        let ctx = manager.create_context(1, 40, 4).unwrap();
        let owner = manager.generate_keys(&ctx).unwrap();
        let material = manager.generate_threshold_keys(&ctx, 5, 3).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let ct = encrypt(&ctx, &material.public.public, &[42.0], &mut rng).unwrap();

        let opened = decrypt(&ctx, &owner.secret, &ct).unwrap();
        assert!((opened[0] - 42.0).abs() > 1.0, "owner recovered {}", opened[0]);
        let own = encrypt(&ctx, &owner.public.public, &[42.0], &mut rng).unwrap();
        assert!((decrypt(&ctx, &owner.secret, &own).unwrap()[0] - 42.0).abs() < 1e-3);
    }

    #[test]
    fn derived_seeds_differ_per_use() {
        assert_eq!(derive_seed(7, "threshold"), derive_seed(7, "threshold"));
        assert_ne!(derive_seed(7, "threshold"), derive_seed(7, "proofs"));
        assert_ne!(derive_seed(7, "threshold"), derive_seed(8, "threshold"));
        assert_ne!(derive_seed(7, "threshold"), 7);
    }

    #[test]
    fn key_pairs_carry_batch_rotations() {
        let manager = manager();
        let ctx = manager.create_context(1, 40, 8).unwrap();
        let mut keys = manager.generate_keys(&ctx).unwrap();
        assert_eq!(keys.public.rotations.len(), 3);
        manager.generate_rotation_keys(&mut keys, &[5]).unwrap();
        assert_eq!(keys.public.rotations.len(), 4);
    }
}
