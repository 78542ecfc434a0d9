//! Length-prefixed, content-addressed binary blobs for ciphertexts and
//! attestations crossing a process boundary.
//!
//! ```text
//! "PCCE" | version u8 | kind u8 | payload length u32 LE | payload | blake3(payload)
//! ```

use pcce_lattice::{Ciphertext, CkksContext, ContextId, RnsPoly};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const MAGIC: &[u8; 4] = b"PCCE";
pub const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 4;
const DIGEST_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobKind {
    Ciphertext = 1,
    ProofBundle = 2,
    DeletionCertificate = 3,
}

impl BlobKind {
    fn from_byte(byte: u8) -> EngineResult<Self> {
        match byte {
            1 => Ok(BlobKind::Ciphertext),
            2 => Ok(BlobKind::ProofBundle),
            3 => Ok(BlobKind::DeletionCertificate),
            other => Err(malformed(format!("unknown blob kind {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireBlob {
    pub kind: BlobKind,
    pub payload: Vec<u8>,
}

fn malformed(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidParameters(format!("malformed wire blob: {}", reason.into()))
}

/// Content address of a payload.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    *blake3::hash(payload).as_bytes()
}

impl WireBlob {
    pub fn new(kind: BlobKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn content_hash(&self) -> [u8; 32] {
        digest(&self.payload)
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| malformed("payload exceeds u32 length prefix"))?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.kind as u8);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.content_hash());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < HEADER_LEN + DIGEST_LEN {
            return Err(malformed("truncated header"));
        }
        if &bytes[..4] != MAGIC {
            return Err(malformed("bad magic"));
        }
        if bytes[4] != VERSION {
            return Err(malformed(format!("unsupported version {}", bytes[4])));
        }
        let kind = BlobKind::from_byte(bytes[5])?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[6..10]);
        let len = u32::from_le_bytes(len) as usize;
        if bytes.len() != HEADER_LEN + len + DIGEST_LEN {
            return Err(malformed("length prefix disagrees with blob size"));
        }
        let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
        if digest(&payload)[..] != bytes[HEADER_LEN + len..] {
            return Err(malformed("checksum mismatch"));
        }
        Ok(Self { kind, payload })
    }
}

pub fn encode_ciphertext(ct: &Ciphertext) -> EngineResult<WireBlob> {
    let level = u16::try_from(ct.level()).map_err(|_| malformed("level exceeds u16"))?;
    let components = u8::try_from(ct.components().len()).map_err(|_| malformed("too many components"))?;
    let mut payload = Vec::new();
    payload.extend_from_slice(ct.context_id().as_bytes());
    payload.extend_from_slice(&level.to_le_bytes());
    payload.extend_from_slice(&ct.scale().to_le_bytes());
    payload.push(components);
    for component in ct.components() {
        for limb in component.limbs() {
            for coeff in limb {
                payload.extend_from_slice(&coeff.to_le_bytes());
            }
        }
    }
    Ok(WireBlob::new(BlobKind::Ciphertext, payload))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(malformed("truncated ciphertext payload"));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> EngineResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Decodes a ciphertext blob and checks it belongs to `ctx`.
pub fn decode_ciphertext(ctx: &CkksContext, blob: &WireBlob) -> EngineResult<Ciphertext> {
    if blob.kind != BlobKind::Ciphertext {
        return Err(malformed("blob does not hold a ciphertext"));
    }
    let mut reader = Reader { bytes: &blob.payload };
    let context_id = ContextId(reader.array::<32>()?);
    let level = u16::from_le_bytes(reader.array::<2>()?) as usize;
    let scale = f64::from_le_bytes(reader.array::<8>()?);
    let components = reader.array::<1>()?[0] as usize;
    if context_id != ctx.id() {
        return Err(EngineError::ContextMismatch {
            expected: ctx.id().short(),
            found: context_id.short(),
        });
    }
    if level > ctx.max_level() || !(2..=3).contains(&components) {
        return Err(malformed("ciphertext shape outside context bounds"));
    }
    let n = ctx.ring_dimension();
    let mut polys = Vec::with_capacity(components);
    for _ in 0..components {
        let mut limbs = Vec::with_capacity(level + 1);
        for _ in 0..=level {
            let raw = reader.take(n * 8)?;
            let limb = raw
                .chunks_exact(8)
                .map(|chunk| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    u64::from_le_bytes(word)
                })
                .collect();
            limbs.push(limb);
        }
        polys.push(RnsPoly::from_limbs(limbs));
    }
    if !reader.bytes.is_empty() {
        return Err(malformed("trailing bytes after ciphertext"));
    }
    Ok(Ciphertext::from_parts(ctx, context_id, level, scale, polys)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcce_lattice::{encrypt, CkksParameters, KeyGenerator};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn ciphertext() -> (CkksContext, Ciphertext) {
        let ctx = CkksContext::new(CkksParameters::new(1, 40, 4).with_min_ring_dimension(64)).unwrap();
        let keys = KeyGenerator::with_seed(&ctx, 1).key_set().unwrap();
        let ct = encrypt(&ctx, &keys.public, &[1.0, 2.0], &mut ChaCha20Rng::seed_from_u64(2)).unwrap();
        (ctx, ct)
    }

    #[test]
    fn ciphertext_blob_survives_transport() {
        let (ctx, ct) = ciphertext();
        let blob = encode_ciphertext(&ct).unwrap();
        let bytes = blob.encode().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        let decoded = WireBlob::decode(&bytes).unwrap();
        assert_eq!(decoded.content_hash(), blob.content_hash());
        assert_eq!(decode_ciphertext(&ctx, &decoded).unwrap(), ct);
    }

    #[test]
    fn detects_corruption_and_truncation() {
        let (_, ct) = ciphertext();
        let mut bytes = encode_ciphertext(&ct).unwrap().encode().unwrap();
        assert!(WireBlob::decode(&bytes[..bytes.len() - 1]).is_err());
        bytes[HEADER_LEN + 40] ^= 1;
        assert!(WireBlob::decode(&bytes).is_err());
    }

    #[test]
    fn refuses_foreign_contexts() {
        let (_, ct) = ciphertext();
        let other = CkksContext::new(CkksParameters::new(1, 40, 4).with_min_ring_dimension(64)).unwrap();
        let blob = encode_ciphertext(&ct).unwrap();
        assert!(matches!(
            decode_ciphertext(&other, &blob),
            Err(EngineError::ContextMismatch { .. })
        ));
    }
}
