//! One tenant's engine, assembled from an [`EngineConfig`].

use std::sync::Arc;

use pcce_lattice::SecretKey;
use pcce_telemetry::TelemetryHandle;
use pcce_zk::{ProofBundle, ProofType};
use tracing::info;

use crate::arithmetic::HomomorphicEngine;
use crate::audit::{AuditSettings, ParticipantRegistry, ThresholdAudit};
use crate::benchmark::{Benchmark, BenchmarkPosition};
use crate::comparison::{
    AttestationParams, ComparisonOp, ComparisonOutcome, KeyHolderOracle, Operand, SecureComparator,
};
use crate::config::EngineConfig;
use crate::context::{derive_seed, ContextManager, KeyMaterial, ThresholdKeyMaterial};
use crate::deletion::{DeletionCertificate, DeletionRegistry};
use crate::error::EngineResult;
use crate::policy::{Classification, PolicyThresholdTable};
use crate::pool::WorkerPool;
use crate::proofs::ProofService;
use crate::psi::{EncodedElement, PrivateSetIntersection, PsiOutcome};
use crate::refresh::KeyHolderRefresher;
use crate::scoring::{ComplianceMetric, ComplianceScorer, EncryptedScore};
use crate::vault::CiphertextHandle;

/// The key owner's deployment: a context, its key pair and every protocol
/// wired to them. Threshold audits get their own key material through
/// [`ComplianceEngine::threshold_audit`].
pub struct ComplianceEngine {
    config: EngineConfig,
    telemetry: TelemetryHandle,
    manager: ContextManager,
    pool: WorkerPool,
    keys: KeyMaterial,
    engine: Arc<HomomorphicEngine>,
    comparator: Arc<SecureComparator>,
    proofs: ProofService,
    psi: PrivateSetIntersection,
    deletions: DeletionRegistry,
}

impl ComplianceEngine {
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        Self::build(config, None)
    }

    /// Deterministic keys and randomness; for reproducible runs only.
    pub fn with_seed(config: EngineConfig, seed: u64) -> EngineResult<Self> {
        Self::build(config, Some(seed))
    }

    fn build(config: EngineConfig, seed: Option<u64>) -> EngineResult<Self> {
        config.validate()?;
        let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
        let mut manager = ContextManager::new(telemetry.clone());
        if let Some(seed) = seed {
            manager = manager.with_seed(seed);
        }
        let ctx = manager.create_from(config.context.parameters())?;
        let keys = manager.generate_keys(&ctx)?;
        let pool = WorkerPool::new(config.workers.pool_size)?;

        let refresher = Arc::new(KeyHolderRefresher::new(
            ctx.clone(),
            keys.secret.clone(),
            keys.public.public.clone(),
        ));
        let mut engine = HomomorphicEngine::new(&keys.public, manager.clone(), pool.clone(), telemetry.clone())?
            .with_refresher(refresher)
            .with_refresh_policy(config.context.refresh);
        if let Some(seed) = seed {
            engine = engine.with_seed(derive_seed(seed, "encrypt"));
        }
        let engine = Arc::new(engine);

        let oracle = Arc::new(KeyHolderOracle::new(ctx.clone(), keys.secret.clone()));
        let comparator = Arc::new(
            SecureComparator::new(engine.clone(), oracle.clone())
                .with_tolerance(config.comparison.tolerance)
                .with_params(AttestationParams {
                    fixed_point_scale: config.proof.fixed_point_scale,
                    range_bits: config.proof.range_bits,
                }),
        );
        let mut proofs = ProofService::new(engine.clone(), oracle, &config.proof)?;
        let mut psi = PrivateSetIntersection::new(telemetry.clone());
        if let Some(seed) = seed {
            proofs = proofs.with_seed(derive_seed(seed, "proofs"));
            psi = psi.with_seed(derive_seed(seed, "psi"));
        }
        let deletions = DeletionRegistry::new(telemetry.clone(), proofs.issuer());
        info!(
            context = %ctx.id(),
            workers = pool.size(),
            refresh = ?config.context.refresh,
            "compliance engine ready"
        );
        Ok(Self {
            config,
            telemetry,
            manager,
            pool,
            keys,
            engine,
            comparator,
            proofs,
            psi,
            deletions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn engine(&self) -> &Arc<HomomorphicEngine> {
        &self.engine
    }

    pub fn comparator(&self) -> &Arc<SecureComparator> {
        &self.comparator
    }

    pub fn proofs(&self) -> &ProofService {
        &self.proofs
    }

    pub fn deletions(&self) -> &DeletionRegistry {
        &self.deletions
    }

    /// Public key the engine endorses its proofs and deletions with.
    pub fn issuer(&self) -> [u8; 32] {
        self.proofs.issuer()
    }

    /// The owner's secret key, for decrypting results the owner may see.
    pub fn secret_key(&self) -> &Arc<SecretKey> {
        &self.keys.secret
    }

    pub fn decrypt(&self, handle: CiphertextHandle) -> EngineResult<Vec<f64>> {
        self.engine.decrypt(&self.keys.secret, handle)
    }

    pub fn score(&self, metrics: &[ComplianceMetric]) -> EngineResult<EncryptedScore> {
        ComplianceScorer::new(self.engine.clone()).score_metrics(metrics)
    }

    pub fn compare(&self, a: CiphertextHandle, b: Operand, op: ComparisonOp) -> EngineResult<ComparisonOutcome> {
        self.comparator.compare(a, b, op)
    }

    pub fn classify(
        &self,
        table: &PolicyThresholdTable,
        metric: &str,
        handle: CiphertextHandle,
    ) -> EngineResult<Classification> {
        table.classify(metric, handle, &self.comparator)
    }

    pub fn benchmark(&self, own: CiphertextHandle, peers: &[CiphertextHandle]) -> EngineResult<BenchmarkPosition> {
        Benchmark::new(self.comparator.clone()).position(own, peers)
    }

    /// Intersection with the configured reveal mode.
    pub fn intersect(
        &self,
        set_a: &[EncodedElement],
        set_b: &[EncodedElement],
        purpose: &str,
    ) -> EngineResult<PsiOutcome> {
        self.psi.intersect(set_a, set_b, purpose, self.config.psi.reveal)
    }

    pub fn generate_proof(
        &self,
        claim_text: &str,
        evidence: &[[u8; 32]],
        scheme: &str,
        proof_type: ProofType,
    ) -> EngineResult<ProofBundle> {
        self.proofs.generate_proof(claim_text, evidence, scheme, proof_type)
    }

    pub fn verify_proof(&self, bundle: &ProofBundle) -> bool {
        self.proofs.verify(bundle)
    }

    /// Discards `handle` and certifies its deletion.
    pub fn delete(&self, handle: CiphertextHandle) -> EngineResult<DeletionCertificate> {
        let (hash, proof) = self.proofs.prove_deletion(handle)?;
        self.deletions.certify_deletion(&hash, &proof)
    }

    /// Threshold keys for the configured participant count and `t`, on this
    /// engine's context.
    pub fn threshold_keys(&self) -> EngineResult<ThresholdKeyMaterial> {
        let audit = &self.config.audit;
        self.manager
            .generate_threshold_keys(self.engine.context(), audit.participants, audit.resolved_threshold())
    }

    /// An audit over `registry` under `material`. Participants must hold
    /// shares of `material`.
    pub fn threshold_audit(
        &self,
        material: &ThresholdKeyMaterial,
        registry: Arc<dyn ParticipantRegistry>,
    ) -> EngineResult<ThresholdAudit> {
        let engine = HomomorphicEngine::new(
            &material.public,
            self.manager.clone(),
            self.pool.clone(),
            self.telemetry.clone(),
        )?;
        ThresholdAudit::new(
            Arc::new(engine),
            registry,
            material.policy,
            AuditSettings::from(&self.config.audit),
        )
    }
}
