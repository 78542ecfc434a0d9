//! Homomorphic arithmetic over vault handles.
//!
//! Every operation reads its operands from the [`CiphertextVault`], runs the
//! lattice work on the worker pool and stores the result under a fresh
//! handle. Operands are never mutated, with one exception: refreshing an
//! exhausted handle replaces its ciphertext in place under the handle's
//! write lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pcce_lattice::{
    decrypt, encrypt, power_of_two_steps, scales_match, Ciphertext, CkksContext, Evaluator,
    PublicKey, SecretKey,
};
use pcce_telemetry::{names, TelemetryHandle};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{ContextManager, PublicMaterial};
use crate::error::{EngineError, EngineResult};
use crate::pool::WorkerPool;
use crate::refresh::{RefreshPolicy, Refresher};
use crate::vault::{CiphertextHandle, CiphertextVault};

/// How a set of ciphertexts is reduced to one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMode {
    Sum,
    Mean,
    Count,
    Weighted(Vec<f64>),
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::Sum => "sum",
            AggregationMode::Mean => "mean",
            AggregationMode::Count => "count",
            AggregationMode::Weighted(_) => "weighted_sum",
        }
    }
}

/// Public record of an aggregation, sufficient to replay it over the same
/// inputs. Holds no plaintext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationMetadata {
    pub operation: String,
    pub weights: Vec<f64>,
    /// Content hashes (hex) of the inputs, in order.
    pub inputs: Vec<String>,
    pub context: String,
    pub output: CiphertextHandle,
    pub output_level: usize,
    pub created_at: DateTime<Utc>,
}

pub struct HomomorphicEngine {
    ctx: Arc<CkksContext>,
    evaluator: Evaluator,
    public: Arc<PublicKey>,
    vault: Arc<CiphertextVault>,
    manager: ContextManager,
    refresher: Option<Arc<dyn Refresher>>,
    refresh_policy: RefreshPolicy,
    pool: WorkerPool,
    telemetry: TelemetryHandle,
    rng: Mutex<ChaCha20Rng>,
}

impl HomomorphicEngine {
    pub fn new(
        material: &PublicMaterial,
        manager: ContextManager,
        pool: WorkerPool,
        telemetry: TelemetryHandle,
    ) -> EngineResult<Self> {
        let ctx = material.context.clone();
        let evaluator = Evaluator::new(ctx.clone())
            .with_relinearization_key(material.relinearization.clone())?
            .with_rotation_keys(material.rotations.clone());
        Ok(Self {
            vault: Arc::new(CiphertextVault::new(ctx.clone())),
            ctx,
            evaluator,
            public: material.public.clone(),
            manager,
            refresher: None,
            refresh_policy: RefreshPolicy::Auto,
            pool,
            telemetry,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        })
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    /// Deterministic encryption randomness for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = ChaCha20Rng::seed_from_u64(seed);
        self
    }

    pub fn context(&self) -> &Arc<CkksContext> {
        &self.ctx
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn public_key(&self) -> &Arc<PublicKey> {
        &self.public
    }

    pub fn vault(&self) -> &Arc<CiphertextVault> {
        &self.vault
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh_policy
    }

    /// Encrypts without storing; used for values that travel elsewhere.
    pub fn encrypt_detached(&self, values: &[f64]) -> EngineResult<Ciphertext> {
        if values.is_empty() || values.len() > self.ctx.batch_size() {
            return Err(EngineError::InvalidParameters(format!(
                "expected 1..={} values, got {}",
                self.ctx.batch_size(),
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidParameters("values must be finite".into()));
        }
        let started = Instant::now();
        let ct = encrypt(&self.ctx, &self.public, values, &mut *self.rng.lock())?;
        self.telemetry.incr(names::CKKS_ENCRYPT);
        self.telemetry.record_elapsed(names::CKKS_ENCRYPT, started);
        Ok(ct)
    }

    pub fn encrypt(&self, values: &[f64]) -> EngineResult<CiphertextHandle> {
        let ct = self.encrypt_detached(values)?;
        self.vault.insert(ct)
    }

    /// Stores a ciphertext produced elsewhere, refusing foreign contexts.
    pub fn import(&self, ct: Ciphertext) -> EngineResult<CiphertextHandle> {
        self.vault.insert(ct)
    }

    /// Decrypts `handle` with a full secret key. Only the key holder calls
    /// this; multi-party flows go through threshold decryption instead.
    pub fn decrypt(&self, secret: &SecretKey, handle: CiphertextHandle) -> EngineResult<Vec<f64>> {
        if secret.context_id() != self.ctx.id() {
            return Err(EngineError::ContextMismatch {
                expected: self.ctx.id().short(),
                found: secret.context_id().short(),
            });
        }
        let ct = self.vault.get(handle)?;
        Ok(decrypt(&self.ctx, secret, &ct)?)
    }

    fn store(&self, ct: Ciphertext) -> EngineResult<CiphertextHandle> {
        self.vault.insert(ct)
    }

    /// Replaces `handle` with a top-level re-encryption of itself.
    pub fn refresh(&self, handle: CiphertextHandle) -> EngineResult<()> {
        let refresher = self.refresher.as_ref().ok_or_else(|| {
            EngineError::InvalidParameters("no refresher configured".into())
        })?;
        let entry = self.vault.entry(handle)?;
        let mut guard = entry.write();
        let fresh = self.manager.refresh(&self.ctx, refresher.as_ref(), &guard)?;
        *guard = fresh;
        Ok(())
    }

    /// Makes sure every handle has at least `required` levels left,
    /// refreshing in place when the policy allows it.
    fn ensure_budget(
        &self,
        handles: &[CiphertextHandle],
        required: usize,
        policy: RefreshPolicy,
    ) -> EngineResult<()> {
        let distinct: BTreeSet<CiphertextHandle> = handles.iter().copied().collect();
        for handle in distinct {
            let entry = self.vault.entry(handle)?;
            let mut guard = entry.write();
            let level = guard.level();
            if level >= required {
                continue;
            }
            match (policy, self.refresher.as_ref()) {
                (RefreshPolicy::Auto, Some(refresher)) => {
                    let fresh = self.manager.refresh(&self.ctx, refresher.as_ref(), &guard)?;
                    *guard = fresh;
                }
                _ => {
                    return Err(EngineError::NoiseBudgetExceeded {
                        level,
                        required: required - level,
                    })
                }
            }
        }
        Ok(())
    }

    fn load(&self, handles: &[CiphertextHandle]) -> EngineResult<Vec<Ciphertext>> {
        handles.iter().map(|h| self.vault.get(*h)).collect()
    }

    fn combine(&self, a: CiphertextHandle, b: CiphertextHandle, subtract: bool) -> EngineResult<CiphertextHandle> {
        let (mut x, mut y) = (self.vault.get(a)?, self.vault.get(b)?);
        if !scales_match(x.scale(), y.scale()) && x.level().min(y.level()) == 0 {
            // Aligning scales costs a level.
            self.ensure_budget(&[a, b], 1, self.refresh_policy)?;
            x = self.vault.get(a)?;
            y = self.vault.get(b)?;
        }
        let out = if subtract {
            self.evaluator.sub(&x, &y)?
        } else {
            self.evaluator.add(&x, &y)?
        };
        self.store(out)
    }

    pub fn add(&self, a: CiphertextHandle, b: CiphertextHandle) -> EngineResult<CiphertextHandle> {
        self.combine(a, b, false)
    }

    pub fn sub(&self, a: CiphertextHandle, b: CiphertextHandle) -> EngineResult<CiphertextHandle> {
        self.combine(a, b, true)
    }

    /// Depth-free scalar multiplication.
    pub fn multiply_plain(&self, handle: CiphertextHandle, scalar: f64) -> EngineResult<CiphertextHandle> {
        let ct = self.vault.get(handle)?;
        let out = self.evaluator.multiply_plain(&ct, scalar)?;
        self.store(out)
    }

    pub fn multiply_cipher(&self, a: CiphertextHandle, b: CiphertextHandle) -> EngineResult<CiphertextHandle> {
        self.multiply_cipher_with(a, b, self.refresh_policy)
    }

    /// Ciphertext product; consumes one level. An exhausted operand is
    /// refreshed under [`RefreshPolicy::Auto`] and rejected otherwise.
    pub fn multiply_cipher_with(
        &self,
        a: CiphertextHandle,
        b: CiphertextHandle,
        policy: RefreshPolicy,
    ) -> EngineResult<CiphertextHandle> {
        self.ensure_budget(&[a, b], 1, policy)?;
        let (x, y) = (self.vault.get(a)?, self.vault.get(b)?);
        let started = Instant::now();
        let out = self.pool.install(|| self.evaluator.multiply(&x, &y))?;
        self.telemetry.incr(names::CKKS_MULTIPLY);
        self.telemetry.record_elapsed(names::CKKS_MULTIPLY, started);
        debug!(level = out.level(), "ciphertext product");
        self.store(out)
    }

    pub fn rotate(&self, handle: CiphertextHandle, steps: usize) -> EngineResult<CiphertextHandle> {
        let ct = self.vault.get(handle)?;
        let out = self.evaluator.rotate(&ct, steps)?;
        self.store(out)
    }

    /// Folds the batch so slot 0 holds the sum of all batch slots.
    pub fn sum_slots(&self, handle: CiphertextHandle) -> EngineResult<CiphertextHandle> {
        let mut acc = self.vault.get(handle)?;
        for step in power_of_two_steps(self.ctx.batch_size()) {
            let rotated = self.evaluator.rotate(&acc, step)?;
            acc = self.evaluator.add(&acc, &rotated)?;
        }
        self.store(acc)
    }

    fn metadata(
        &self,
        operation: &str,
        weights: Vec<f64>,
        inputs: &[CiphertextHandle],
        output: CiphertextHandle,
    ) -> EngineResult<AggregationMetadata> {
        let inputs = inputs
            .iter()
            .map(|h| self.vault.content_hash(*h).map(hex::encode))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(AggregationMetadata {
            operation: operation.to_owned(),
            weights,
            inputs,
            context: self.ctx.id().to_string(),
            output,
            output_level: self.vault.level(output)?,
            created_at: Utc::now(),
        })
    }

    /// `Σ w_i · ct_i` over a balanced summation tree, with one rescale.
    pub fn weighted_aggregate(
        &self,
        handles: &[CiphertextHandle],
        weights: &[f64],
    ) -> EngineResult<(CiphertextHandle, AggregationMetadata)> {
        if handles.is_empty() || handles.len() != weights.len() {
            return Err(EngineError::InvalidParameters(format!(
                "{} ciphertexts but {} weights",
                handles.len(),
                weights.len()
            )));
        }
        self.ensure_budget(handles, 1, self.refresh_policy)?;
        let cts = self.load(handles)?;
        let out = self.pool.install(|| self.evaluator.weighted_sum(&cts, weights))?;
        let output = self.store(out)?;
        let metadata = self.metadata("weighted_sum", weights.to_vec(), handles, output)?;
        debug!(inputs = handles.len(), %output, "weighted aggregate computed");
        Ok((output, metadata))
    }

    fn sum_inner(&self, cts: Vec<Ciphertext>) -> EngineResult<Ciphertext> {
        Ok(self.pool.install(|| self.evaluator.tree_sum(cts))?)
    }

    pub fn aggregate(
        &self,
        handles: &[CiphertextHandle],
        mode: &AggregationMode,
    ) -> EngineResult<(CiphertextHandle, AggregationMetadata)> {
        if handles.is_empty() {
            return Err(EngineError::InvalidParameters("nothing to aggregate".into()));
        }
        let n = handles.len() as f64;
        let (output, weights) = match mode {
            AggregationMode::Weighted(weights) => return self.weighted_aggregate(handles, weights),
            AggregationMode::Sum => {
                let sum = self.sum_inner(self.load(handles)?)?;
                (self.store(sum)?, vec![1.0; handles.len()])
            }
            AggregationMode::Mean => {
                let sum = self.sum_inner(self.load(handles)?)?;
                let mean = self.evaluator.multiply_plain(&sum, 1.0 / n)?;
                (self.store(mean)?, vec![1.0 / n; handles.len()])
            }
            AggregationMode::Count => (self.encrypt(&[n])?, Vec::new()),
        };
        let metadata = self.metadata(mode.as_str(), weights, handles, output)?;
        Ok((output, metadata))
    }

    /// Population variance `E[x²] − E[x]²`, computed as
    /// `(n·Σx² − (Σx)²) / n²` so both terms share a scale and the whole
    /// computation spends a single level.
    pub fn variance(&self, handles: &[CiphertextHandle]) -> EngineResult<CiphertextHandle> {
        if handles.is_empty() {
            return Err(EngineError::InvalidParameters("variance of nothing".into()));
        }
        self.ensure_budget(handles, 1, self.refresh_policy)?;
        let cts = self.load(handles)?;
        let n = cts.len();
        let out = self.pool.install(|| -> EngineResult<Ciphertext> {
            let squares = cts
                .par_iter()
                .map(|ct| self.evaluator.square(ct))
                .collect::<Result<Vec<_>, _>>()?;
            let sum_of_squares = self.evaluator.tree_sum(squares)?;
            let sum = self.evaluator.tree_sum(cts.clone())?;
            let square_of_sum = self.evaluator.square(&sum)?;
            let scaled = self.evaluator.multiply_integer(&sum_of_squares, n as i64)?;
            let diff = self.evaluator.sub(&scaled, &square_of_sum)?;
            Ok(self.evaluator.multiply_plain(&diff, 1.0 / (n * n) as f64)?)
        })?;
        if let Err(err) = self.telemetry.record_counter(names::CKKS_MULTIPLY, n as u64 + 1) {
            warn!(error = %err, "variance multiply count not recorded");
        }
        self.store(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::KeyMaterial;
    use crate::refresh::KeyHolderRefresher;
    use approx::assert_abs_diff_eq;

    fn engine(depth: usize) -> (HomomorphicEngine, KeyMaterial) {
        let manager = ContextManager::default().with_min_ring_dimension(64).with_seed(21);
        let ctx = manager.create_context(depth, 40, 8).unwrap();
        let keys = manager.generate_keys(&ctx).unwrap();
        let refresher = Arc::new(KeyHolderRefresher::new(
            ctx.clone(),
            keys.secret.clone(),
            keys.public.public.clone(),
        ));
        let engine = HomomorphicEngine::new(
            &keys.public,
            manager,
            WorkerPool::new(2).unwrap(),
            TelemetryHandle::default(),
        )
        .unwrap()
        .with_refresher(refresher)
        .with_seed(5);
        (engine, keys)
    }

    #[test]
    fn weighted_aggregate_matches_plain_arithmetic() {
        let (engine, keys) = engine(2);
        let handles: Vec<_> = [70.0, 80.0, 90.0]
            .iter()
            .map(|v| engine.encrypt(&[*v]).unwrap())
            .collect();
        let (out, metadata) = engine.weighted_aggregate(&handles, &[0.3, 0.3, 0.4]).unwrap();
        let value = engine.decrypt(&keys.secret, out).unwrap()[0];
        assert_abs_diff_eq!(value, 81.0, epsilon = 1e-3);
        assert_eq!(metadata.operation, "weighted_sum");
        assert_eq!(metadata.inputs.len(), 3);
        assert_eq!(metadata.output, out);
    }

    #[test]
    fn mean_sum_count_and_variance() {
        let (engine, keys) = engine(2);
        let handles: Vec<_> = [70.0, 80.0, 90.0]
            .iter()
            .map(|v| engine.encrypt(&[*v]).unwrap())
            .collect();
        let read = |h| engine.decrypt(&keys.secret, h).unwrap()[0];
        let (sum, _) = engine.aggregate(&handles, &AggregationMode::Sum).unwrap();
        assert_abs_diff_eq!(read(sum), 240.0, epsilon = 1e-4);
        let (mean, meta) = engine.aggregate(&handles, &AggregationMode::Mean).unwrap();
        assert_abs_diff_eq!(read(mean), 80.0, epsilon = 1e-4);
        assert_eq!(engine.vault().level(mean).unwrap(), 2);
        assert_eq!(meta.operation, "mean");
        let (count, _) = engine.aggregate(&handles, &AggregationMode::Count).unwrap();
        assert_abs_diff_eq!(read(count), 3.0, epsilon = 1e-4);

        let variance = engine.variance(&handles).unwrap();
        assert_eq!(engine.vault().level(variance).unwrap(), 1);
        assert_abs_diff_eq!(read(variance), 200.0 / 3.0, epsilon = 1e-2);
    }

    #[test]
    fn variance_counts_its_multiplies_and_survives_counter_overflow() {
        let (engine, keys) = engine(2);
        let handles: Vec<_> = [1.0, 2.0, 3.0]
            .iter()
            .map(|v| engine.encrypt(&[*v]).unwrap())
            .collect();
        engine.variance(&handles).unwrap();
        assert_eq!(engine.telemetry().peek_counter(names::CKKS_MULTIPLY), 4);

        engine
            .telemetry()
            .record_counter(names::CKKS_MULTIPLY, u64::MAX - 4)
            .unwrap();
        let variance = engine.variance(&handles).unwrap();
        assert_eq!(engine.telemetry().peek_counter(names::CKKS_MULTIPLY), u64::MAX);
        assert_abs_diff_eq!(engine.decrypt(&keys.secret, variance).unwrap()[0], 2.0 / 3.0, epsilon = 1e-2);
    }

    #[test]
    fn exhausted_operands_refresh_or_fail_by_policy() {
        let (engine, keys) = engine(1);
        let a = engine.encrypt(&[3.0]).unwrap();
        let b = engine.encrypt(&[2.0]).unwrap();
        let product = engine.multiply_cipher(a, b).unwrap();
        assert_eq!(engine.vault().level(product).unwrap(), 0);

        let err = engine
            .multiply_cipher_with(product, b, RefreshPolicy::Disabled)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoiseBudgetExceeded { level: 0, required: 1 }));

        let again = engine.multiply_cipher(product, b).unwrap();
        assert_abs_diff_eq!(engine.decrypt(&keys.secret, again).unwrap()[0], 12.0, epsilon = 1e-3);
        assert_eq!(engine.telemetry().peek_counter(names::CKKS_REFRESH), 1);
        assert_eq!(engine.vault().level(product).unwrap(), 1);
    }

    #[test]
    fn sum_slots_folds_the_batch() {
        let (engine, keys) = engine(1);
        let h = engine.encrypt(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        let folded = engine.sum_slots(h).unwrap();
        assert_abs_diff_eq!(engine.decrypt(&keys.secret, folded).unwrap()[0], 36.0, epsilon = 1e-3);
        let rotated = engine.rotate(h, 1).unwrap();
        assert_abs_diff_eq!(engine.decrypt(&keys.secret, rotated).unwrap()[0], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn rejects_bad_inputs() {
        let (engine, _) = engine(1);
        assert!(engine.encrypt(&[]).is_err());
        assert!(engine.encrypt(&[f64::NAN]).is_err());
        assert!(engine.encrypt(&[0.0; 9]).is_err());
        let h = engine.encrypt(&[1.0]).unwrap();
        assert!(matches!(
            engine.weighted_aggregate(&[h], &[0.5, 0.5]),
            Err(EngineError::InvalidParameters(_))
        ));
    }
}
