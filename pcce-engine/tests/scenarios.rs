use approx::assert_abs_diff_eq;
use pcce_engine::{
    ComparisonOp, ComplianceEngine, EncodedElement, EngineConfig, EngineError, Operand, PolicyThresholdTable,
    RevealMode, Severity,
};
use pcce_telemetry::names;
use pcce_zk::ProofType;
use pretty_assertions::assert_eq;

const SCHEME: &str = "pedersen-range-ristretto255";

fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.context.depth = 2;
    config.context.batch_size = 4;
    config.context.min_ring_dimension = 64;
    config.workers.pool_size = 2;
    config
}

fn elements(prefix: &str, count: usize) -> Vec<EncodedElement> {
    (0..count)
        .map(|i| EncodedElement::blake3(format!("{prefix}-{i}@example.org").as_bytes()))
        .collect()
}

#[test]
fn weighted_score_is_proven_without_revealing_it() {
    let engine = ComplianceEngine::with_seed(small_config(), 41).unwrap();
    let arithmetic = engine.engine();
    let inputs = [70.0, 80.0, 90.0]
        .iter()
        .map(|value| arithmetic.encrypt(&[*value]).unwrap())
        .collect::<Vec<_>>();
    let (score, metadata) = arithmetic.weighted_aggregate(&inputs, &[0.3, 0.3, 0.4]).unwrap();
    assert_eq!(metadata.inputs.len(), 3);
    assert_abs_diff_eq!(engine.decrypt(score).unwrap()[0], 81.0, epsilon = 1e-3);

    let evidence = arithmetic.vault().content_hash(score).unwrap();
    let bundle = engine
        .generate_proof("weighted score >= 80", &[evidence], SCHEME, ProofType::ComplianceCertificate)
        .unwrap();
    assert!(engine.verify_proof(&bundle));

    let other = engine
        .generate_proof("weighted score >= 75", &[evidence], SCHEME, ProofType::ComplianceCertificate)
        .unwrap();
    let mut swapped = bundle.clone();
    swapped.claim_hash = other.claim_hash;
    assert!(!engine.verify_proof(&swapped));

    let unmet = engine.generate_proof("weighted score >= 90", &[evidence], SCHEME, ProofType::ComplianceCertificate);
    assert!(unmet.is_err());
    let generic = engine.generate_proof("weighted score >= 80", &[evidence], "zk-snark", ProofType::ComplianceCertificate);
    assert!(matches!(generic, Err(EngineError::InvalidParameters(_))));
    assert_eq!(engine.telemetry().peek_counter(names::PROOF_VERIFIED), 1);
}

#[test]
fn disjoint_sets_share_nothing() {
    let engine = ComplianceEngine::with_seed(small_config(), 5).unwrap();
    let outcome = engine
        .intersect(&elements("left", 10), &elements("right", 10), "sanctions-screening")
        .unwrap();
    assert_eq!(outcome.intersection_size, 0);
    assert!(!outcome.match_found);
    assert!(outcome.revealed.is_none());
    assert!(outcome.proof.verify());
}

#[test]
fn one_shared_identifier_is_counted_once() {
    let mut config = small_config();
    config.psi.reveal = RevealMode::RevealMatches;
    let engine = ComplianceEngine::with_seed(config, 6).unwrap();
    let mut left = elements("left", 10);
    let mut right = elements("right", 10);
    let shared = EncodedElement::blake3(b"shared@example.org");
    left[4] = shared.clone();
    right[7] = shared.clone();
    right.push(shared.clone());

    let outcome = engine.intersect(&left, &right, "fraud-ring").unwrap();
    assert_eq!(outcome.intersection_size, 1);
    assert!(outcome.match_found);
    assert_eq!(outcome.revealed, Some(vec![shared]));
    assert_eq!(engine.telemetry().peek_counter(names::PSI_RUNS), 1);
}

#[test]
fn mixed_encodings_are_rejected() {
    let engine = ComplianceEngine::with_seed(small_config(), 8).unwrap();
    let left = vec![EncodedElement::blake3(b"a")];
    let right = vec![EncodedElement::sha512(b"a")];
    let err = engine.intersect(&left, &right, "kyc").unwrap_err();
    assert!(matches!(err, EngineError::PsiEncodingMismatch { .. }));
}

#[test]
fn deletion_certificates_are_idempotent() {
    let engine = ComplianceEngine::with_seed(small_config(), 12).unwrap();
    let handle = engine.engine().encrypt(&[42.0]).unwrap();
    let (hash, proof) = engine.proofs().prove_deletion(handle).unwrap();
    assert!(!engine.engine().vault().contains(handle));

    let first = engine.deletions().certify_deletion(&hash, &proof).unwrap();
    let second = engine.deletions().certify_deletion(&hash, &proof).unwrap();
    assert_eq!(first, second);
    assert!(first.verified);
    assert_eq!(engine.deletions().len(), 1);
    assert_eq!(engine.telemetry().peek_counter(names::DELETION_CERTIFIED), 1);

    let other = engine.engine().encrypt(&[7.0]).unwrap();
    let certificate = engine.delete(other).unwrap();
    assert_ne!(certificate.certificate_id, first.certificate_id);
    assert!(matches!(engine.delete(other), Err(EngineError::UnknownHandle(_))));
}

#[test]
fn deletion_proof_for_another_hash_is_refused() {
    let engine = ComplianceEngine::with_seed(small_config(), 13).unwrap();
    let a = engine.engine().encrypt(&[1.0]).unwrap();
    let b = engine.engine().encrypt(&[2.0]).unwrap();
    let b_hash = engine.engine().vault().content_hash(b).unwrap();
    let (_, proof) = engine.proofs().prove_deletion(a).unwrap();
    let err = engine.deletions().certify_deletion(&b_hash, &proof).unwrap_err();
    assert!(matches!(err, EngineError::DeletionProofInvalid { .. }));
}

#[test]
fn ciphertexts_from_another_engine_are_refused() {
    let first = ComplianceEngine::with_seed(small_config(), 1).unwrap();
    let second = ComplianceEngine::with_seed(small_config(), 1).unwrap();
    let handle = first.engine().encrypt(&[3.0]).unwrap();
    let blob = first.engine().vault().export(handle).unwrap().encode().unwrap();
    let err = second.engine().vault().import(&blob).unwrap_err();
    assert!(matches!(err, EngineError::ContextMismatch { .. }));
}

#[test]
fn comparisons_reveal_only_attested_bits() {
    let engine = ComplianceEngine::with_seed(small_config(), 21).unwrap();
    let a = engine.engine().encrypt(&[62.5]).unwrap();
    let b = engine.engine().encrypt(&[60.0]).unwrap();
    let greater = engine.compare(a, Operand::Cipher(b), ComparisonOp::Greater).unwrap();
    assert!(greater.result);
    assert!(greater.verify());
    let equal = engine.compare(a, Operand::Plain(62.5), ComparisonOp::Equal).unwrap();
    assert!(equal.result);
    let less = engine.compare(a, Operand::Plain(50.0), ComparisonOp::Less).unwrap();
    assert!(!less.result);
    assert_eq!(engine.telemetry().peek_counter(names::COMPARE_RUNS), 3);
}

#[test]
fn comparisons_at_the_tolerance_band_are_stable() {
    let mut config = small_config();
    config.comparison.tolerance = 0.05;
    let engine = ComplianceEngine::with_seed(config, 23).unwrap();
    let tol = engine.config().comparison.tolerance;
    let threshold = 80.0;
    let cases = [
        (threshold + tol + 0.0002, ComparisonOp::Greater, true),
        (threshold + tol - 0.0002, ComparisonOp::Greater, false),
        (threshold - tol - 0.0002, ComparisonOp::Less, true),
        (threshold - tol + 0.0002, ComparisonOp::Less, false),
        (threshold + tol - 0.0002, ComparisonOp::Equal, true),
        (threshold - tol + 0.0002, ComparisonOp::Equal, true),
        (threshold + tol + 0.0002, ComparisonOp::Equal, false),
        (threshold - tol - 0.0002, ComparisonOp::Equal, false),
    ];
    for (value, op, expected) in cases {
        let handle = engine.engine().encrypt(&[value]).unwrap();
        for _ in 0..25 {
            let outcome = engine.compare(handle, Operand::Plain(threshold), op).unwrap();
            assert_eq!(outcome.result, expected, "{value} {op:?} {threshold}");
            assert!(outcome.verify());
        }
    }

    // Exactly on the band edge either bit is acceptable, but it must not change between calls.
    for (value, op) in [
        (threshold + tol, ComparisonOp::Greater),
        (threshold - tol, ComparisonOp::Less),
        (threshold + tol, ComparisonOp::Equal),
    ] {
        let handle = engine.engine().encrypt(&[value]).unwrap();
        let first = engine.compare(handle, Operand::Plain(threshold), op).unwrap().result;
        for _ in 0..25 {
            assert_eq!(engine.compare(handle, Operand::Plain(threshold), op).unwrap().result, first);
        }
    }
}

#[test]
fn severity_follows_the_policy_table() {
    let engine = ComplianceEngine::with_seed(small_config(), 22).unwrap();
    let table = PolicyThresholdTable::sample();
    let cases = [(30.0, Severity::Low), (60.0, Severity::Medium), (75.0, Severity::High)];
    for (risk, expected) in cases {
        let handle = engine.engine().encrypt(&[risk]).unwrap();
        let classification = engine.classify(&table, "risk_score", handle).unwrap();
        assert_eq!(classification.severity, expected, "risk {risk}");
        assert_eq!(classification.table_version, 1);
    }
    let compliance = engine.engine().encrypt(&[70.0]).unwrap();
    let classification = engine.classify(&table, "compliance_score", compliance).unwrap();
    assert_eq!(classification.severity, Severity::Medium);
    assert!(engine.classify(&table, "unknown", compliance).is_err());
}

#[test]
fn benchmark_positions_against_peers() {
    let engine = ComplianceEngine::with_seed(small_config(), 23).unwrap();
    let own = engine.engine().encrypt(&[85.0]).unwrap();
    let peers = [70.0, 80.0, 90.0, 75.0]
        .iter()
        .map(|value| engine.engine().encrypt(&[*value]).unwrap())
        .collect::<Vec<_>>();
    let position = engine.benchmark(own, &peers).unwrap();
    assert!(position.above_mean);
    assert_abs_diff_eq!(position.percentile, 75.0);
    assert_eq!(position.peers, 4);
    assert_abs_diff_eq!(engine.decrypt(position.peer_mean).unwrap()[0], 78.75, epsilon = 1e-3);
}

#[test]
fn scoring_reports_through_telemetry() {
    let engine = ComplianceEngine::with_seed(small_config(), 24).unwrap();
    let metrics = vec![
        pcce_engine::ComplianceMetric::weighted("data_protection", 90.0, 0.5),
        pcce_engine::ComplianceMetric::weighted("security", 70.0, 0.5),
    ];
    let scored = engine.score(&metrics).unwrap();
    assert_abs_diff_eq!(engine.decrypt(scored.score).unwrap()[0], 80.0, epsilon = 1e-3);
    assert_eq!(engine.telemetry().peek_counter(names::CKKS_ENCRYPT), 2);
    let snapshot = engine.telemetry().flush();
    assert_eq!(snapshot.counter(names::CKKS_ENCRYPT), 2);
    assert_eq!(engine.telemetry().peek_counter(names::CKKS_ENCRYPT), 0);
}

#[test]
fn claim_over_encrypted_evidence_binds_its_hash() {
    let engine = ComplianceEngine::with_seed(small_config(), 25).unwrap();
    let evidence = engine.engine().encrypt(&[85.0]).unwrap();
    let bundle = engine
        .proofs()
        .prove_handle("weighted score ≥ 80", evidence, ProofType::AuditVerification)
        .unwrap();
    assert!(engine.verify_proof(&bundle));
    assert!(pcce_engine::proofs::verify_proof(&bundle.proof, &bundle.verification_key, &bundle.claim_hash));

    let mut replayed = bundle.clone();
    replayed.claim_hash = pcce_zk::ClaimHash([7u8; 32]);
    assert!(!engine.verify_proof(&replayed));
    assert!(matches!(
        engine.proofs().require_valid(&replayed),
        Err(EngineError::ProofVerificationFailed(_))
    ));
}
