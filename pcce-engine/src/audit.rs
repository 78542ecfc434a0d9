//! Threshold multi-party audit rounds.
//!
//! A round moves through
//! `Collecting → QuorumCheck → Aggregating → PartialDecrypting → Combining → Result`
//! and ends in `Failed` on quorum loss or timeout. Collection and partial
//! decryption fan in over [`FuturesUnordered`] and stop as soon as `t`
//! responses are in; the first `t` submitters form the decrypting roster.
//! Lattice work runs on the engine's worker pool, never on the runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use pcce_lattice::{
    combine, encrypt, partial_decrypt, Ciphertext, CkksContext, KeyShare, PartialDecryption, PublicKey,
    ThresholdPolicy,
};
use pcce_telemetry::names;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::arithmetic::HomomorphicEngine;
use crate::config::AuditSection;
use crate::context::{ensure_context, PublicMaterial};
use crate::error::{EngineError, EngineResult};
use crate::vault::{CiphertextHandle, CiphertextVault};

/// How submissions are combined before decryption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAggregation {
    Sum,
    #[default]
    Mean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditState {
    Collecting,
    QuorumCheck,
    Aggregating,
    PartialDecrypting,
    Combining,
    Result,
    Failed,
}

impl AuditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditState::Collecting => "COLLECTING",
            AuditState::QuorumCheck => "QUORUM_CHECK",
            AuditState::Aggregating => "AGGREGATING",
            AuditState::PartialDecrypting => "PARTIAL_DECRYPTING",
            AuditState::Combining => "COMBINING",
            AuditState::Result => "RESULT",
            AuditState::Failed => "FAILED",
        }
    }

    fn next(self) -> Option<AuditState> {
        match self {
            AuditState::Collecting => Some(AuditState::QuorumCheck),
            AuditState::QuorumCheck => Some(AuditState::Aggregating),
            AuditState::Aggregating => Some(AuditState::PartialDecrypting),
            AuditState::PartialDecrypting => Some(AuditState::Combining),
            AuditState::Combining => Some(AuditState::Result),
            AuditState::Result | AuditState::Failed => None,
        }
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditVerdict {
    Compliant,
    Partial,
    NonCompliant,
}

impl AuditVerdict {
    /// `compliant` at or above the pass threshold, `partial` at or above
    /// half of it.
    pub fn classify(aggregate: f64, pass_threshold: f64) -> Self {
        if aggregate >= pass_threshold {
            AuditVerdict::Compliant
        } else if aggregate >= pass_threshold / 2.0 {
            AuditVerdict::Partial
        } else {
            AuditVerdict::NonCompliant
        }
    }
}

/// Public identity of a participant: who it is and which share it holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditParticipant {
    pub id: String,
    pub share_index: u8,
    pub share_commitment: [u8; 32],
}

/// The engine's view of a remote participant. Shares stay behind this
/// boundary; only ciphertexts and partial decryptions cross it.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    fn descriptor(&self) -> &AuditParticipant;

    /// The participant's encrypted input for `round`.
    async fn submit(&self, round: u64) -> EngineResult<Ciphertext>;

    async fn partial_decrypt(
        &self,
        round: u64,
        aggregate: &Ciphertext,
        roster: &[u8],
    ) -> EngineResult<PartialDecryption>;
}

/// Who holds which key share, keyed by participant id.
pub trait ParticipantRegistry: Send + Sync {
    fn register(&self, client: Arc<dyn ParticipantClient>) -> EngineResult<()>;

    fn remove(&self, id: &str) -> Option<Arc<dyn ParticipantClient>>;

    fn lookup(&self, id: &str) -> EngineResult<Arc<dyn ParticipantClient>>;

    /// All registered participants ordered by share index.
    fn participants(&self) -> Vec<Arc<dyn ParticipantClient>>;

    fn len(&self) -> usize {
        self.participants().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryParticipantRegistry {
    clients: DashMap<String, Arc<dyn ParticipantClient>>,
}

impl InMemoryParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParticipantRegistry for InMemoryParticipantRegistry {
    fn register(&self, client: Arc<dyn ParticipantClient>) -> EngineResult<()> {
        let descriptor = client.descriptor();
        if descriptor.share_index == 0 {
            return Err(EngineError::InvalidParameters("share indices start at 1".into()));
        }
        let clash = self.clients.iter().any(|entry| {
            entry.key() != &descriptor.id && entry.value().descriptor().share_index == descriptor.share_index
        });
        if clash {
            return Err(EngineError::InvalidParameters(format!(
                "share {} is already registered",
                descriptor.share_index
            )));
        }
        debug!(participant = %descriptor.id, share = descriptor.share_index, "participant registered");
        self.clients.insert(descriptor.id.clone(), client);
        Ok(())
    }

    fn remove(&self, id: &str) -> Option<Arc<dyn ParticipantClient>> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    fn lookup(&self, id: &str) -> EngineResult<Arc<dyn ParticipantClient>> {
        self.clients
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownParticipant(id.to_owned()))
    }

    fn participants(&self) -> Vec<Arc<dyn ParticipantClient>> {
        let mut all: Vec<_> = self.clients.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|client| client.descriptor().share_index);
        all
    }

    fn len(&self) -> usize {
        self.clients.len()
    }
}

/// An in-process participant holding its own value and key share.
pub struct LocalParticipant {
    descriptor: AuditParticipant,
    value: f64,
    share: KeyShare,
    ctx: Arc<CkksContext>,
    public: Arc<PublicKey>,
    submit_delay: Duration,
    decrypt_delay: Duration,
    offline: bool,
    rng: Mutex<ChaCha20Rng>,
}

impl LocalParticipant {
    pub fn new(id: impl Into<String>, value: f64, share: KeyShare, material: &PublicMaterial) -> Self {
        let descriptor = AuditParticipant {
            id: id.into(),
            share_index: share.index(),
            share_commitment: share.commitment(),
        };
        Self {
            descriptor,
            value,
            share,
            ctx: material.context.clone(),
            public: material.public.clone(),
            submit_delay: Duration::ZERO,
            decrypt_delay: Duration::ZERO,
            offline: false,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn with_decrypt_delay(mut self, delay: Duration) -> Self {
        self.decrypt_delay = delay;
        self
    }

    /// Never answers.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }
}

#[async_trait]
impl ParticipantClient for LocalParticipant {
    fn descriptor(&self) -> &AuditParticipant {
        &self.descriptor
    }

    async fn submit(&self, _round: u64) -> EngineResult<Ciphertext> {
        if self.offline {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.submit_delay).await;
        let ct = encrypt(&self.ctx, &self.public, &[self.value], &mut *self.rng.lock())?;
        Ok(ct)
    }

    async fn partial_decrypt(
        &self,
        _round: u64,
        aggregate: &Ciphertext,
        roster: &[u8],
    ) -> EngineResult<PartialDecryption> {
        tokio::time::sleep(self.decrypt_delay).await;
        let partial = partial_decrypt(&self.ctx, &self.share, aggregate, roster, &mut *self.rng.lock())?;
        Ok(partial)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditSettings {
    pub pass_threshold: f64,
    pub round_deadline: Duration,
    pub deadline_extension: Duration,
    pub max_retries: u32,
    pub aggregation: AuditAggregation,
}

impl From<&AuditSection> for AuditSettings {
    fn from(section: &AuditSection) -> Self {
        Self {
            pass_threshold: section.pass_threshold,
            round_deadline: Duration::from_millis(section.round_deadline_ms),
            deadline_extension: Duration::from_millis(section.deadline_extension_ms),
            max_retries: section.max_retries,
            aggregation: section.aggregation,
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self::from(&AuditSection::default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub round: u64,
    pub verdict: AuditVerdict,
    pub aggregate: f64,
    pub aggregation: AuditAggregation,
    /// The encrypted aggregate, kept in [`ThresholdAudit::vault`] under the
    /// threshold keys' context.
    pub aggregate_handle: CiphertextHandle,
    /// Context the aggregate is encrypted under.
    pub context: String,
    /// Ids of the participants whose shares decrypted the aggregate.
    pub roster: Vec<String>,
    pub threshold: u8,
    pub participants: u8,
    pub trail: Vec<AuditState>,
}

struct RoundTracker {
    round: u64,
    state: AuditState,
    trail: Vec<AuditState>,
}

impl RoundTracker {
    fn new(round: u64) -> Self {
        info!(round, state = %AuditState::Collecting, "audit round opened");
        Self {
            round,
            state: AuditState::Collecting,
            trail: vec![AuditState::Collecting],
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.state.next() {
            info!(round = self.round, from = %self.state, to = %next, "audit state");
            self.state = next;
            self.trail.push(next);
        }
    }
}

type Submission = (Arc<dyn ParticipantClient>, Ciphertext);

pub struct ThresholdAudit {
    engine: Arc<HomomorphicEngine>,
    registry: Arc<dyn ParticipantRegistry>,
    policy: ThresholdPolicy,
    settings: AuditSettings,
    rounds: AtomicU64,
}

impl ThresholdAudit {
    pub fn new(
        engine: Arc<HomomorphicEngine>,
        registry: Arc<dyn ParticipantRegistry>,
        policy: ThresholdPolicy,
        settings: AuditSettings,
    ) -> EngineResult<Self> {
        if policy.t == 0 || policy.t > policy.n {
            return Err(EngineError::InvalidThreshold {
                t: policy.t as usize,
                n: policy.n as usize,
            });
        }
        if !settings.pass_threshold.is_finite() {
            return Err(EngineError::InvalidParameters("pass threshold must be finite".into()));
        }
        Ok(Self {
            engine,
            registry,
            policy,
            settings,
            rounds: AtomicU64::new(0),
        })
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<dyn ParticipantRegistry> {
        &self.registry
    }

    /// The engine over the threshold public key; aggregates land here.
    pub fn engine(&self) -> &Arc<HomomorphicEngine> {
        &self.engine
    }

    /// Holds every round's [`AuditResult::aggregate_handle`].
    pub fn vault(&self) -> &Arc<CiphertextVault> {
        self.engine.vault()
    }

    /// One round with the configured deadline.
    pub async fn run(&self) -> EngineResult<AuditResult> {
        self.run_round(self.settings.round_deadline).await
    }

    /// Runs a round, re-soliciting participants with an extended deadline
    /// after quorum failures and timeouts. Other errors end the audit.
    pub async fn run_with_retry(&self) -> EngineResult<AuditResult> {
        let mut deadline = self.settings.round_deadline;
        let mut attempt = 0;
        loop {
            match self.run_round(deadline).await {
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    deadline += self.settings.deadline_extension;
                    warn!(
                        attempt,
                        deadline_ms = deadline.as_millis() as u64,
                        error = %err,
                        "re-soliciting participants"
                    );
                }
                outcome => return outcome,
            }
        }
    }

    /// `deadline` bounds each of the two waiting phases separately.
    pub async fn run_round(&self, deadline: Duration) -> EngineResult<AuditResult> {
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        self.engine.telemetry().incr(names::AUDIT_ROUNDS);
        let outcome = self
            .execute(round, deadline)
            .instrument(info_span!("audit_round", round))
            .await;
        if let Err(err) = &outcome {
            self.engine.telemetry().incr(names::AUDIT_FAILURES);
            warn!(round, state = %AuditState::Failed, error = %err, "audit round failed");
        }
        outcome
    }

    async fn collect(&self, round: u64, deadline: Duration) -> EngineResult<Vec<Submission>> {
        let required = self.policy.t as usize;
        let expires = Instant::now() + deadline;
        let mut pending: FuturesUnordered<_> = self
            .registry
            .participants()
            .into_iter()
            .map(|client| async move {
                let submission = client.submit(round).await;
                (client, submission)
            })
            .collect();
        let mut submissions: Vec<Submission> = Vec::with_capacity(required);
        while submissions.len() < required {
            match timeout_at(expires, pending.next()).await {
                Ok(Some((client, Ok(ct)))) => {
                    ensure_context(self.engine.context(), &ct)?;
                    debug!(participant = %client.descriptor().id, "submission received");
                    submissions.push((client, ct));
                }
                Ok(Some((client, Err(err)))) => {
                    warn!(participant = %client.descriptor().id, error = %err, "submission rejected");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(received = submissions.len(), "collection deadline reached");
                    break;
                }
            }
        }
        Ok(submissions)
    }

    async fn execute(&self, round: u64, deadline: Duration) -> EngineResult<AuditResult> {
        let required = self.policy.t as usize;
        let mut tracker = RoundTracker::new(round);

        let submissions = self.collect(round, deadline).await?;
        tracker.advance();
        if submissions.len() < required {
            return Err(EngineError::InsufficientQuorum {
                received: submissions.len(),
                required,
                round,
            });
        }

        tracker.advance();
        let aggregation = self.settings.aggregation;
        let engine = self.engine.clone();
        let inputs: Vec<Ciphertext> = submissions.iter().map(|(_, ct)| ct.clone()).collect();
        let aggregate = self
            .engine
            .pool()
            .spawn(move || -> EngineResult<Ciphertext> {
                let count = inputs.len() as f64;
                let sum = engine.evaluator().tree_sum(inputs)?;
                Ok(match aggregation {
                    AuditAggregation::Sum => sum,
                    AuditAggregation::Mean => engine.evaluator().multiply_plain(&sum, 1.0 / count)?,
                })
            })
            .await??;
        let aggregate_handle = self.engine.import(aggregate.clone())?;

        tracker.advance();
        let partials = self.gather_partials(round, deadline, &submissions, aggregate.clone()).await?;

        tracker.advance();
        let ctx = self.engine.context().clone();
        let policy = self.policy;
        let slots = self
            .engine
            .pool()
            .spawn(move || combine(&ctx, &aggregate, &partials, policy))
            .await??;
        let value = slots
            .first()
            .copied()
            .ok_or_else(|| EngineError::InvalidParameters("empty combined decryption".into()))?;

        tracker.advance();
        let verdict = AuditVerdict::classify(value, self.settings.pass_threshold);
        let roster: Vec<String> = submissions.iter().map(|(c, _)| c.descriptor().id.clone()).collect();
        info!(
            round,
            verdict = ?verdict,
            roster = roster.len(),
            t = self.policy.t,
            n = self.policy.n,
            "audit round complete"
        );
        Ok(AuditResult {
            round,
            verdict,
            aggregate: value,
            aggregation,
            aggregate_handle,
            context: hex::encode(self.engine.context().id().as_bytes()),
            roster,
            threshold: self.policy.t,
            participants: self.policy.n,
            trail: tracker.trail,
        })
    }

    async fn gather_partials(
        &self,
        round: u64,
        deadline: Duration,
        submissions: &[Submission],
        aggregate: Ciphertext,
    ) -> EngineResult<Vec<PartialDecryption>> {
        let required = self.policy.t as usize;
        let roster: Arc<Vec<u8>> = Arc::new(
            submissions
                .iter()
                .map(|(client, _)| client.descriptor().share_index)
                .collect(),
        );
        let aggregate = Arc::new(aggregate);
        let expires = Instant::now() + deadline;
        let mut pending: FuturesUnordered<_> = submissions
            .iter()
            .map(|(client, _)| {
                let client = client.clone();
                let roster = roster.clone();
                let aggregate = aggregate.clone();
                async move {
                    let partial = client.partial_decrypt(round, &aggregate, &roster).await;
                    (client, partial)
                }
            })
            .collect();
        let mut partials = Vec::with_capacity(required);
        while partials.len() < required {
            match timeout_at(expires, pending.next()).await {
                Ok(Some((client, Ok(partial)))) => {
                    if partial.participant != client.descriptor().share_index {
                        return Err(EngineError::InvalidParameters(format!(
                            "{} answered for share {}",
                            client.descriptor().id,
                            partial.participant
                        )));
                    }
                    partials.push(partial);
                }
                Ok(Some((client, Err(err)))) => {
                    warn!(participant = %client.descriptor().id, error = %err, "partial decryption refused");
                    return Err(EngineError::InsufficientQuorum {
                        received: partials.len(),
                        required,
                        round,
                    });
                }
                Ok(None) => {
                    return Err(EngineError::InsufficientQuorum {
                        received: partials.len(),
                        required,
                        round,
                    })
                }
                Err(_) => {
                    return Err(EngineError::Timeout {
                        stage: AuditState::PartialDecrypting.as_str(),
                        round,
                    })
                }
            }
        }
        Ok(partials)
    }
}
