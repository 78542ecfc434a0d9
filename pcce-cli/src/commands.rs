use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use pcce_engine::{
    ComplianceEngine, ComplianceMetric, ConfigFormat, EncodedElement, EncodingScheme, InMemoryParticipantRegistry,
    LocalParticipant, ParticipantRegistry, PolicyThresholdTable,
};
use pcce_zk::ProofType;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Args)]
pub struct ScoreArgs {
    /// Metric as `category=value`, optionally `category=value@weight`.
    #[arg(long = "metric", value_parser = parse_metric, required = true)]
    metrics: Vec<ComplianceMetric>,
    /// Prove this claim about the score, e.g. "weighted score >= 80".
    #[arg(long)]
    claim: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    /// One contributed value per participant, in share order.
    #[arg(long, value_delimiter = ',', required = true)]
    values: Vec<f64>,
    /// 1-based participants that never answer.
    #[arg(long, value_delimiter = ',')]
    offline: Vec<usize>,
    /// Submission delay added per participant position, in milliseconds.
    #[arg(long, default_value_t = 0)]
    stagger_ms: u64,
}

#[derive(Debug, Args)]
pub struct PsiArgs {
    /// Querier's identifiers, one per line.
    #[arg(long)]
    left: PathBuf,
    /// Responder's identifiers, one per line.
    #[arg(long)]
    right: PathBuf,
    /// Purpose label bound into the element encoding.
    #[arg(long)]
    purpose: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ProofKind {
    ComplianceCertificate,
    AuditVerification,
    RegulatoryProof,
    ConsentProof,
}

impl From<ProofKind> for ProofType {
    fn from(kind: ProofKind) -> Self {
        match kind {
            ProofKind::ComplianceCertificate => ProofType::ComplianceCertificate,
            ProofKind::AuditVerification => ProofType::AuditVerification,
            ProofKind::RegulatoryProof => ProofType::RegulatoryProof,
            ProofKind::ConsentProof => ProofType::ConsentProof,
        }
    }
}

#[derive(Debug, Args)]
pub struct ProveArgs {
    /// Value to encrypt as evidence.
    #[arg(long)]
    value: f64,
    /// Claim text, e.g. "consent rate >= 95%".
    #[arg(long)]
    claim: String,
    #[arg(long, value_enum, default_value_t = ProofKind::ComplianceCertificate)]
    proof_type: ProofKind,
    /// Proof construction; defaults to the configured scheme.
    #[arg(long)]
    scheme: Option<String>,
    /// Discard the evidence afterwards and certify the deletion.
    #[arg(long)]
    delete: bool,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Policy threshold table (TOML or YAML).
    #[arg(long, default_value = "configs/policy.toml")]
    policy: PathBuf,
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    policy_format: ConfigFormat,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    value: f64,
}

#[derive(Debug, Args)]
pub struct BenchmarkArgs {
    #[arg(long)]
    own: f64,
    #[arg(long, value_delimiter = ',', required = true)]
    peers: Vec<f64>,
}

fn parse_metric(raw: &str) -> Result<ComplianceMetric, String> {
    let (category, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected category=value, got `{raw}`"))?;
    let number = |text: &str| text.trim().parse::<f64>().map_err(|err| format!("`{text}`: {err}"));
    Ok(match rest.split_once('@') {
        Some((value, weight)) => ComplianceMetric::weighted(category.trim(), number(value)?, number(weight)?),
        None => ComplianceMetric::new(category.trim(), number(rest)?),
    })
}

fn read_identifiers(path: &Path, scheme: EncodingScheme) -> Result<Vec<EncodedElement>> {
    let contents =
        std::fs::read_to_string(path).wrap_err_with(|| format!("unable to read {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match scheme {
            EncodingScheme::Blake3 => EncodedElement::blake3(line.as_bytes()),
            EncodingScheme::Sha512 => EncodedElement::sha512(line.as_bytes()),
        })
        .collect())
}

pub fn score(engine: &ComplianceEngine, args: ScoreArgs) -> Result<Value> {
    let scored = engine.score(&args.metrics)?;
    let value = engine
        .decrypt(scored.score)?
        .first()
        .copied()
        .ok_or_else(|| eyre!("empty decryption"))?;
    let mut report = json!({
        "score": value,
        "handle": scored.score,
        "metadata": scored.metadata,
    });
    if let Some(claim) = args.claim {
        let bundle = engine
            .proofs()
            .prove_handle(&claim, scored.score, ProofType::ComplianceCertificate)?;
        report["claim_hash"] = json!(bundle.claim_hash.to_hex());
        report["proof_valid"] = json!(engine.verify_proof(&bundle));
    }
    Ok(report)
}

pub async fn audit(engine: &ComplianceEngine, args: AuditArgs) -> Result<Value> {
    let material = engine.threshold_keys()?;
    if args.values.len() != material.shares.len() {
        bail!(
            "{} values given for {} participants",
            args.values.len(),
            material.shares.len()
        );
    }
    let registry = Arc::new(InMemoryParticipantRegistry::new());
    for (position, (share, value)) in material.shares.iter().zip(&args.values).enumerate() {
        let mut participant =
            LocalParticipant::new(format!("participant-{}", position + 1), *value, share.clone(), &material.public)
                .with_submit_delay(Duration::from_millis(args.stagger_ms * position as u64));
        if args.offline.contains(&(position + 1)) {
            participant = participant.offline();
        }
        registry.register(Arc::new(participant))?;
    }
    info!(participants = registry.len(), t = material.policy.t, "starting threshold audit");
    let audit = engine.threshold_audit(&material, registry)?;
    let result = audit.run_with_retry().await?;
    Ok(serde_json::to_value(result)?)
}

pub fn psi(engine: &ComplianceEngine, args: PsiArgs) -> Result<Value> {
    let scheme = engine.config().psi.encoding;
    let left = read_identifiers(&args.left, scheme)?;
    let right = read_identifiers(&args.right, scheme)?;
    let outcome = engine.intersect(&left, &right, &args.purpose)?;
    Ok(json!({
        "purpose": args.purpose,
        "intersection_size": outcome.intersection_size,
        "match_found": outcome.match_found,
        "proof_valid": outcome.proof.verify(),
        "revealed": outcome.revealed,
    }))
}

pub fn prove(engine: &ComplianceEngine, args: ProveArgs) -> Result<Value> {
    let handle = engine.engine().encrypt(&[args.value])?;
    let evidence = engine.engine().vault().content_hash(handle)?;
    let scheme = args
        .scheme
        .unwrap_or_else(|| engine.proofs().default_scheme().as_str().to_owned());
    let bundle = engine.generate_proof(&args.claim, &[evidence], &scheme, args.proof_type.into())?;
    let mut report = json!({
        "claim_hash": bundle.claim_hash.to_hex(),
        "proof_valid": engine.verify_proof(&bundle),
        "bundle": bundle,
    });
    if args.delete {
        report["deletion"] = serde_json::to_value(engine.delete(handle)?)?;
    }
    Ok(report)
}

pub fn classify(engine: &ComplianceEngine, args: ClassifyArgs) -> Result<Value> {
    let table = PolicyThresholdTable::load(&args.policy, args.policy_format)?;
    let handle = engine.engine().encrypt(&[args.value])?;
    let classification = engine.classify(&table, &args.metric, handle)?;
    let attested = classification.comparisons.iter().all(|outcome| outcome.verify());
    Ok(json!({
        "metric": classification.metric,
        "severity": classification.severity,
        "table": classification.table,
        "table_version": classification.table_version,
        "comparisons": classification.comparisons.len(),
        "attested": attested,
    }))
}

pub fn benchmark(engine: &ComplianceEngine, args: BenchmarkArgs) -> Result<Value> {
    let own = engine.engine().encrypt(&[args.own])?;
    let peers = args
        .peers
        .iter()
        .map(|peer| engine.engine().encrypt(&[*peer]))
        .collect::<Result<Vec<_>, _>>()?;
    let position = engine.benchmark(own, &peers)?;
    Ok(json!({
        "above_mean": position.above_mean,
        "percentile": position.percentile,
        "peers": position.peers,
    }))
}
