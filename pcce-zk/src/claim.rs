use std::fmt;
use std::str::FromStr;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{ZkError, ZkResult};

/// Concrete proof constructions. Generic family names ("zk-snark",
/// "bulletproof", ...) are not accepted: a scheme must identify exactly one
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofScheme {
    /// Pedersen commitment on Ristretto255 plus a bit-decomposition range
    /// proof (CDS OR-proofs, Fiat-Shamir over SHA-512).
    PedersenRangeRistretto255,
}

impl ProofScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofScheme::PedersenRangeRistretto255 => "pedersen-range-ristretto255",
        }
    }
}

impl Default for ProofScheme {
    fn default() -> Self {
        ProofScheme::PedersenRangeRistretto255
    }
}

impl FromStr for ProofScheme {
    type Err = ZkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pedersen-range-ristretto255" | "pedersen-range" => {
                Ok(ProofScheme::PedersenRangeRistretto255)
            }
            other => Err(ZkError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for ProofScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a proof bundle attests to. Bound into the claim hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    ComplianceCertificate,
    AuditVerification,
    RegulatoryProof,
    DataDeletion,
    ConsentProof,
}

impl ProofType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofType::ComplianceCertificate => "compliance_certificate",
            ProofType::AuditVerification => "audit_verification",
            ProofType::RegulatoryProof => "regulatory_proof",
            ProofType::DataDeletion => "data_deletion",
            ProofType::ConsentProof => "consent_proof",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Comparison {
    AtLeast,
    GreaterThan,
    AtMost,
    LessThan,
    Equal,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::AtLeast => ">=",
            Comparison::GreaterThan => ">",
            Comparison::AtMost => "<=",
            Comparison::LessThan => "<",
            Comparison::Equal => "==",
        }
    }

    pub fn holds(&self, value: i64, threshold: i64) -> bool {
        match self {
            Comparison::AtLeast => value >= threshold,
            Comparison::GreaterThan => value > threshold,
            Comparison::AtMost => value <= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::Equal => value == threshold,
        }
    }
}

// Longer tokens first so ">=" is not read as ">".
const OPERATORS: [(&str, Comparison); 8] = [
    ("≥", Comparison::AtLeast),
    (">=", Comparison::AtLeast),
    ("≤", Comparison::AtMost),
    ("<=", Comparison::AtMost),
    ("==", Comparison::Equal),
    (">", Comparison::GreaterThan),
    ("<", Comparison::LessThan),
    ("=", Comparison::Equal),
];

/// `subject op threshold`, parsed from claim text such as
/// `"weighted score ≥ 80"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub subject: String,
    pub op: Comparison,
    pub threshold: f64,
}

impl Predicate {
    pub fn parse(claim: &str) -> ZkResult<Self> {
        let (idx, token, op) = OPERATORS
            .iter()
            .filter_map(|(token, op)| claim.find(token).map(|idx| (idx, *token, *op)))
            .min_by_key(|(idx, token, _)| (*idx, usize::MAX - token.len()))
            .ok_or_else(|| ZkError::MalformedClaim("no comparison operator".into()))?;
        let subject = claim[..idx].trim();
        let rhs = claim[idx + token.len()..].trim().trim_end_matches('%').trim();
        if subject.is_empty() {
            return Err(ZkError::MalformedClaim("missing subject".into()));
        }
        let threshold: f64 = rhs
            .parse()
            .map_err(|_| ZkError::MalformedClaim(format!("threshold `{rhs}` is not a number")))?;
        if !threshold.is_finite() {
            return Err(ZkError::MalformedClaim("threshold must be finite".into()));
        }
        Ok(Self {
            subject: subject.to_owned(),
            op,
            threshold,
        })
    }

    pub fn canonical(&self) -> String {
        format!("{} {} {}", self.subject, self.op.symbol(), self.threshold)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimHash(pub [u8; 32]);

impl ClaimHash {
    pub fn compute(
        proof_type: ProofType,
        claim_text: &str,
        predicate: &Predicate,
        evidence: &[[u8; 32]],
    ) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"pcce/claim");
        hasher.update(proof_type.as_str().as_bytes());
        hasher.update(&(claim_text.len() as u64).to_le_bytes());
        hasher.update(claim_text.as_bytes());
        let canonical = predicate.canonical();
        hasher.update(&(canonical.len() as u64).to_le_bytes());
        hasher.update(canonical.as_bytes());
        hasher.update(&(evidence.len() as u64).to_le_bytes());
        for hash in evidence {
            hasher.update(hash);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ClaimHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClaimHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimHash({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_common_claim_shapes() {
        assert_eq!(
            Predicate::parse("weighted score ≥ 80").unwrap(),
            Predicate {
                subject: "weighted score".into(),
                op: Comparison::AtLeast,
                threshold: 80.0
            }
        );
        assert_eq!(Predicate::parse("risk<=30").unwrap().op, Comparison::AtMost);
        assert_eq!(Predicate::parse("retained_copies == 0").unwrap().op, Comparison::Equal);
        assert_eq!(Predicate::parse("consent rate > 95%").unwrap().threshold, 95.0);
    }

    #[test]
    fn rejects_malformed_claims() {
        assert!(Predicate::parse("score is great").is_err());
        assert!(Predicate::parse(">= 80").is_err());
        assert!(Predicate::parse("score >= high").is_err());
    }

    #[test]
    fn generic_scheme_labels_are_rejected() {
        assert!("pedersen-range-ristretto255".parse::<ProofScheme>().is_ok());
        for label in ["zk-snark", "zk-stark", "bulletproof", "plonk"] {
            assert!(matches!(
                label.parse::<ProofScheme>(),
                Err(ZkError::UnsupportedScheme(_))
            ));
        }
    }

    #[test]
    fn claim_hash_covers_type_and_evidence() {
        let p = Predicate::parse("score >= 80").unwrap();
        let base = ClaimHash::compute(ProofType::ComplianceCertificate, "score >= 80", &p, &[[1; 32]]);
        assert_ne!(base, ClaimHash::compute(ProofType::RegulatoryProof, "score >= 80", &p, &[[1; 32]]));
        assert_ne!(base, ClaimHash::compute(ProofType::ComplianceCertificate, "score >= 80", &p, &[[2; 32]]));
    }
}
