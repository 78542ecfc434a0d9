use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use pcce_lattice::{Ciphertext, CkksContext};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ensure_context;
use crate::error::{EngineError, EngineResult};
use crate::wire::{decode_ciphertext, encode_ciphertext, WireBlob};

/// Handle numbers are process-wide, so a handle from one vault never
/// addresses an entry of another.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque reference handed to collaborators instead of ciphertext bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CiphertextHandle(pub u64);

impl fmt::Display for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct#{}", self.0)
    }
}

/// Ciphertexts of one context. Each entry sits behind its own lock so
/// in-place refreshes of a handle are serialized while distinct handles
/// proceed in parallel.
pub struct CiphertextVault {
    ctx: Arc<CkksContext>,
    entries: DashMap<CiphertextHandle, Arc<RwLock<Ciphertext>>>,
}

impl CiphertextVault {
    pub fn new(ctx: Arc<CkksContext>) -> Self {
        Self {
            ctx,
            entries: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<CkksContext> {
        &self.ctx
    }

    pub fn insert(&self, ct: Ciphertext) -> EngineResult<CiphertextHandle> {
        ensure_context(&self.ctx, &ct)?;
        let handle = CiphertextHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        debug!(%handle, level = ct.level(), "ciphertext stored");
        self.entries.insert(handle, Arc::new(RwLock::new(ct)));
        Ok(handle)
    }

    pub(crate) fn entry(&self, handle: CiphertextHandle) -> EngineResult<Arc<RwLock<Ciphertext>>> {
        self.entries
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::UnknownHandle(handle.0))
    }

    /// Snapshot of the ciphertext behind `handle`.
    pub fn get(&self, handle: CiphertextHandle) -> EngineResult<Ciphertext> {
        Ok(self.entry(handle)?.read().clone())
    }

    /// Remaining multiplicative levels of `handle`.
    pub fn level(&self, handle: CiphertextHandle) -> EngineResult<usize> {
        Ok(self.entry(handle)?.read().level())
    }

    pub fn contains(&self, handle: CiphertextHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire blob of the current ciphertext.
    pub fn export(&self, handle: CiphertextHandle) -> EngineResult<WireBlob> {
        encode_ciphertext(&self.entry(handle)?.read())
    }

    pub fn import(&self, bytes: &[u8]) -> EngineResult<CiphertextHandle> {
        let blob = WireBlob::decode(bytes)?;
        self.insert(decode_ciphertext(&self.ctx, &blob)?)
    }

    /// blake3 of the handle's wire payload; evidence references use it.
    pub fn content_hash(&self, handle: CiphertextHandle) -> EngineResult<[u8; 32]> {
        Ok(self.export(handle)?.content_hash())
    }

    pub fn find_by_hash(&self, hash: &[u8; 32]) -> Option<CiphertextHandle> {
        self.entries.iter().find_map(|entry| {
            let blob = encode_ciphertext(&entry.value().read()).ok()?;
            (blob.content_hash() == *hash).then(|| *entry.key())
        })
    }

    /// Drops the ciphertext and returns the hash it was known by.
    pub fn remove(&self, handle: CiphertextHandle) -> EngineResult<[u8; 32]> {
        let hash = self.content_hash(handle)?;
        self.entries
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle.0))?;
        debug!(%handle, hash = %hex::encode(hash), "ciphertext discarded");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcce_lattice::{encrypt, CkksParameters, KeyGenerator};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn stores_exports_and_removes() {
        let ctx = Arc::new(
            CkksContext::new(CkksParameters::new(1, 40, 4).with_min_ring_dimension(64)).unwrap(),
        );
        let keys = KeyGenerator::with_seed(&ctx, 1).key_set().unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let vault = CiphertextVault::new(ctx.clone());
        let ct = encrypt(&ctx, &keys.public, &[4.0], &mut rng).unwrap();
        let handle = vault.insert(ct.clone()).unwrap();
        assert_eq!(vault.get(handle).unwrap(), ct);

        let hash = vault.content_hash(handle).unwrap();
        assert_eq!(vault.find_by_hash(&hash), Some(handle));
        let copy = vault.import(&vault.export(handle).unwrap().encode().unwrap()).unwrap();
        assert_ne!(copy, handle);
        assert_eq!(vault.content_hash(copy).unwrap(), hash);

        assert_eq!(vault.remove(handle).unwrap(), hash);
        assert!(matches!(vault.get(handle), Err(EngineError::UnknownHandle(_))));
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn handles_are_never_shared_between_vaults() {
        let ctx = Arc::new(
            CkksContext::new(CkksParameters::new(1, 40, 4).with_min_ring_dimension(64)).unwrap(),
        );
        let keys = KeyGenerator::with_seed(&ctx, 1).key_set().unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (first, second) = (CiphertextVault::new(ctx.clone()), CiphertextVault::new(ctx.clone()));
        let a = first.insert(encrypt(&ctx, &keys.public, &[1.0], &mut rng).unwrap()).unwrap();
        let b = second.insert(encrypt(&ctx, &keys.public, &[2.0], &mut rng).unwrap()).unwrap();
        assert_ne!(a, b);
        assert!(matches!(second.get(a), Err(EngineError::UnknownHandle(_))));
        assert!(matches!(first.get(b), Err(EngineError::UnknownHandle(_))));
    }
}
