use pcce_zk::{
    verify_issued_proof, verify_proof, ClaimHash, ClaimProver, ClaimRequest, IssuerKey, ProofScheme, ProofType,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[test]
fn weighted_score_claim_verifies_only_under_its_own_hash() {
    let prover = ClaimProver::new(100, 32).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(85);
    let issuer = IssuerKey::generate(&mut rng);
    let evidence = [[0xab; 32], [0xcd; 32]];
    let bundle = prover
        .prove(
            ClaimRequest {
                claim_text: "weighted score ≥ 80",
                evidence: &evidence,
                scheme: ProofScheme::PedersenRangeRistretto255,
                proof_type: ProofType::ComplianceCertificate,
            },
            85.0,
            &issuer,
            &mut rng,
        )
        .unwrap();

    assert!(verify_proof(&bundle.proof, &bundle.verification_key, &bundle.claim_hash));

    let other = ClaimHash([0x11; 32]);
    for _ in 0..3 {
        assert!(!verify_proof(&bundle.proof, &bundle.verification_key, &other));
    }
}

#[test]
fn verification_key_survives_json_transport() {
    let prover = ClaimProver::new(100, 16).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let issuer = IssuerKey::generate(&mut rng);
    let bundle = prover
        .prove(
            ClaimRequest {
                claim_text: "consent rate >= 95",
                evidence: &[[1; 32]],
                scheme: ProofScheme::PedersenRangeRistretto255,
                proof_type: ProofType::ConsentProof,
            },
            97.5,
            &issuer,
            &mut rng,
        )
        .unwrap();
    let json = serde_json::to_string(&bundle).unwrap();
    let decoded: pcce_zk::ProofBundle = serde_json::from_str(&json).unwrap();
    assert!(verify_proof(&decoded.proof, &decoded.verification_key, &decoded.claim_hash));
    assert!(verify_issued_proof(
        &decoded.proof,
        &decoded.verification_key,
        &decoded.claim_hash,
        &issuer.public()
    ));
}

#[test]
fn self_issued_bundles_do_not_pass_for_the_key_holder() {
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let key_holder = IssuerKey::generate(&mut rng);
    let outsider = IssuerKey::generate(&mut rng);
    let prover = ClaimProver::new(100, 32).unwrap();
    let forged = prover
        .prove(
            ClaimRequest {
                claim_text: "retained_copies == 0",
                evidence: &[[0x42; 32]],
                scheme: ProofScheme::PedersenRangeRistretto255,
                proof_type: ProofType::DataDeletion,
            },
            0.0,
            &outsider,
            &mut rng,
        )
        .unwrap();
    let (proof, vk, hash) = (&forged.proof, &forged.verification_key, &forged.claim_hash);
    assert!(!verify_issued_proof(proof, vk, hash, &key_holder.public()));

    let mut claimed = vk.clone();
    claimed.issuer = key_holder.public();
    assert!(!verify_proof(proof, &claimed, hash));
}
