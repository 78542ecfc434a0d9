//! Private set intersection over Ristretto255.
//!
//! Elements are hashed to the group and exchanged as Diffie-Hellman blinded
//! points. The querying side learns `b·H(x)` for its own elements through
//! the responder's evaluation and compares those against the responder's
//! shuffled tags `b·H(y)`. The responder proves with a batched DLEQ proof
//! that every evaluation used the key behind its published public point.

use std::collections::HashSet;
use std::fmt;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use parking_lot::Mutex;
use pcce_telemetry::{names, TelemetryHandle};
use pcce_zk::pedersen::{decode_point, encode_point, random_scalar};
use pcce_zk::{DleqProof, Transcript};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::info;
use zeroize::Zeroize;

use crate::error::{EngineError, EngineResult};

const HASH_DOMAIN: &[u8] = b"pcce/psi/element/v1";
const PROOF_DOMAIN: &[u8] = b"pcce/psi/responder/v1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingScheme {
    #[default]
    Blake3,
    Sha512,
}

impl EncodingScheme {
    pub fn digest_len(&self) -> usize {
        match self {
            EncodingScheme::Blake3 => 32,
            EncodingScheme::Sha512 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingScheme::Blake3 => "blake3",
            EncodingScheme::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for EncodingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevealMode {
    /// Only the cardinality leaves the protocol.
    #[default]
    CountOnly,
    /// The querying side also learns which of its elements matched.
    RevealMatches,
}

/// A set member in its hashed form. Raw identifiers never enter the
/// protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedElement {
    pub scheme: EncodingScheme,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

impl EncodedElement {
    pub fn blake3(identifier: &[u8]) -> Self {
        Self {
            scheme: EncodingScheme::Blake3,
            bytes: blake3::hash(identifier).as_bytes().to_vec(),
        }
    }

    pub fn sha512(identifier: &[u8]) -> Self {
        use sha2::Digest;
        Self {
            scheme: EncodingScheme::Sha512,
            bytes: Sha512::digest(identifier).to_vec(),
        }
    }

    /// Wraps an already hashed element, checking the digest length.
    pub fn from_digest(scheme: EncodingScheme, bytes: Vec<u8>) -> EngineResult<Self> {
        if bytes.len() != scheme.digest_len() {
            return Err(EngineError::InvalidParameters(format!(
                "{scheme} digests are {} bytes, got {}",
                scheme.digest_len(),
                bytes.len()
            )));
        }
        Ok(Self { scheme, bytes })
    }

    pub fn from_hex(scheme: EncodingScheme, text: &str) -> EngineResult<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|err| EngineError::InvalidParameters(format!("element is not hex: {err}")))?;
        Self::from_digest(scheme, bytes)
    }

    fn to_point(&self) -> RistrettoPoint {
        let mut input = Vec::with_capacity(HASH_DOMAIN.len() + self.bytes.len() + 8);
        input.extend_from_slice(HASH_DOMAIN);
        input.extend_from_slice(self.scheme.as_str().as_bytes());
        input.extend_from_slice(&self.bytes);
        RistrettoPoint::hash_from_bytes::<Sha512>(&input)
    }
}

/// Transcript of the responder's evaluation, checkable by either side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsiProof {
    pub responder_public: [u8; 32],
    pub queries: Vec<[u8; 32]>,
    pub responses: Vec<[u8; 32]>,
    pub dleq: DleqProof,
}

fn proof_transcript() -> Transcript {
    Transcript::new(PROOF_DOMAIN)
}

impl PsiProof {
    pub fn verify(&self) -> bool {
        if self.queries.len() != self.responses.len() {
            return false;
        }
        let decode = |points: &[[u8; 32]]| points.iter().map(decode_point).collect::<Result<Vec<_>, _>>();
        let (Ok(public), Ok(queries), Ok(responses)) = (
            decode_point(&self.responder_public),
            decode(&self.queries),
            decode(&self.responses),
        ) else {
            return false;
        };
        self.dleq.verify(
            &mut proof_transcript(),
            &RISTRETTO_BASEPOINT_POINT,
            &public,
            &queries,
            &responses,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsiOutcome {
    pub intersection_size: usize,
    pub match_found: bool,
    pub proof: PsiProof,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revealed: Option<Vec<EncodedElement>>,
}

/// Runs both roles of the intersection protocol.
pub struct PrivateSetIntersection {
    telemetry: TelemetryHandle,
    rng: Mutex<ChaCha20Rng>,
}

impl PrivateSetIntersection {
    pub fn new(telemetry: TelemetryHandle) -> Self {
        Self {
            telemetry,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Intersects `set_a` (the querying side) with `set_b` (the responder).
    /// Duplicate elements count once. `purpose` only labels the log line.
    pub fn intersect(
        &self,
        set_a: &[EncodedElement],
        set_b: &[EncodedElement],
        purpose: &str,
        mode: RevealMode,
    ) -> EngineResult<PsiOutcome> {
        let scheme = common_scheme(set_a, set_b)?;
        let set_a = dedup(set_a);
        let set_b = dedup(set_b);

        let mut rng = self.rng.lock();
        let mut a = random_scalar(&mut *rng);
        let mut b = random_scalar(&mut *rng);

        // Querying side: blind each hashed element with `a`, sent in an
        // order only the querier knows.
        let mut order: Vec<usize> = (0..set_a.len()).collect();
        order.shuffle(&mut *rng);
        let queries: Vec<RistrettoPoint> = order
            .par_iter()
            .map(|&i| set_a[i].to_point() * a)
            .collect();

        // Responder: evaluate queries in order, tag and shuffle its own set.
        let responses: Vec<RistrettoPoint> = queries.par_iter().map(|q| q * b).collect();
        let dleq = DleqProof::prove(
            &mut proof_transcript(),
            &RISTRETTO_BASEPOINT_POINT,
            b,
            &queries,
            &responses,
            &mut *rng,
        )?;
        let mut tags: Vec<[u8; 32]> = set_b
            .par_iter()
            .map(|y| encode_point(&(y.to_point() * b)))
            .collect();
        tags.shuffle(&mut *rng);
        let proof = PsiProof {
            responder_public: encode_point(&(RISTRETTO_BASEPOINT_POINT * b)),
            queries: queries.iter().map(encode_point).collect(),
            responses: responses.iter().map(encode_point).collect(),
            dleq,
        };
        b.zeroize();

        // Querying side: check the evaluation, unblind and match.
        if !proof.verify() {
            a.zeroize();
            return Err(EngineError::ProofVerificationFailed(
                "psi responder evaluation proof rejected".into(),
            ));
        }
        let unblind: Scalar = a.invert();
        a.zeroize();
        let tags: HashSet<[u8; 32]> = tags.into_iter().collect();
        let mut hits: Vec<usize> = order
            .iter()
            .zip(&responses)
            .filter(|(_, response)| tags.contains(&encode_point(&(*response * unblind))))
            .map(|(&i, _)| i)
            .collect();
        hits.sort_unstable();
        let matched: Vec<EncodedElement> = hits.into_iter().map(|i| set_a[i].clone()).collect();

        self.telemetry.incr(names::PSI_RUNS);
        info!(
            purpose,
            scheme = %scheme,
            queried = set_a.len(),
            responder = set_b.len(),
            intersection = matched.len(),
            "private set intersection complete"
        );
        Ok(PsiOutcome {
            intersection_size: matched.len(),
            match_found: !matched.is_empty(),
            proof,
            revealed: match mode {
                RevealMode::CountOnly => None,
                RevealMode::RevealMatches => Some(matched),
            },
        })
    }
}

fn common_scheme(set_a: &[EncodedElement], set_b: &[EncodedElement]) -> EngineResult<EncodingScheme> {
    let mut elements = set_a.iter().chain(set_b);
    let Some(first) = elements.next() else {
        return Ok(EncodingScheme::default());
    };
    for element in std::iter::once(first).chain(elements) {
        if element.bytes.len() != element.scheme.digest_len() {
            return Err(EngineError::InvalidParameters(format!(
                "{} element has {} bytes",
                element.scheme,
                element.bytes.len()
            )));
        }
        if element.scheme != first.scheme {
            return Err(EngineError::PsiEncodingMismatch {
                left: first.scheme.to_string(),
                right: element.scheme.to_string(),
            });
        }
    }
    Ok(first.scheme)
}

fn dedup(set: &[EncodedElement]) -> Vec<EncodedElement> {
    let mut seen = HashSet::with_capacity(set.len());
    set.iter().filter(|e| seen.insert(*e)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(names: &[&str]) -> Vec<EncodedElement> {
        names.iter().map(|n| EncodedElement::blake3(n.as_bytes())).collect()
    }

    fn psi() -> PrivateSetIntersection {
        PrivateSetIntersection::new(TelemetryHandle::default()).with_seed(5)
    }

    #[test]
    fn counts_overlap_without_revealing_by_default() {
        let psi = psi();
        let outcome = psi
            .intersect(
                &ids(&["alice", "bob", "carol", "bob"]),
                &ids(&["carol", "dave", "bob"]),
                "sanctions-screening",
                RevealMode::CountOnly,
            )
            .unwrap();
        assert_eq!(outcome.intersection_size, 2);
        assert!(outcome.match_found);
        assert!(outcome.revealed.is_none());
        assert!(outcome.proof.verify());
        assert_eq!(psi.telemetry.peek_counter(names::PSI_RUNS), 1);
    }

    #[test]
    fn reveals_matches_in_query_order() {
        let outcome = psi()
            .intersect(
                &ids(&["x", "y", "z"]),
                &ids(&["z", "x"]),
                "kyc",
                RevealMode::RevealMatches,
            )
            .unwrap();
        assert_eq!(outcome.revealed, Some(ids(&["x", "z"])));
    }

    #[test]
    fn disjoint_and_empty_sets() {
        let psi = psi();
        let disjoint = psi
            .intersect(&ids(&["a"]), &ids(&["b"]), "p", RevealMode::CountOnly)
            .unwrap();
        assert_eq!(disjoint.intersection_size, 0);
        assert!(!disjoint.match_found);
        let empty = psi.intersect(&[], &ids(&["b"]), "p", RevealMode::CountOnly).unwrap();
        assert_eq!(empty.intersection_size, 0);
    }

    #[test]
    fn purpose_does_not_change_the_protocol() {
        let left = ids(&["a", "b", "c"]);
        let right = ids(&["b", "c", "d"]);
        let breach = psi()
            .intersect(&left, &right, "breach-check", RevealMode::CountOnly)
            .unwrap();
        let consent = psi()
            .intersect(&left, &right, "consent-verification", RevealMode::CountOnly)
            .unwrap();
        assert_eq!(breach.intersection_size, 2);
        assert_eq!(breach, consent);
        assert!(consent.proof.verify());
    }

    #[test]
    fn rejects_mixed_encodings() {
        let err = psi()
            .intersect(
                &ids(&["a"]),
                &[EncodedElement::sha512(b"a")],
                "p",
                RevealMode::CountOnly,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PsiEncodingMismatch { .. }));
        assert!(EncodedElement::from_digest(EncodingScheme::Sha512, vec![0; 32]).is_err());
    }
}
