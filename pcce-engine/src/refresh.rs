//! Restoring the noise budget of exhausted ciphertexts.
//!
//! A full CKKS bootstrap is out of reach for the parameter sizes used here,
//! so refresh is modelled as collective re-encryption: whoever holds enough
//! key material decrypts the ciphertext inside its own boundary and
//! re-encrypts it at the top level. The `Refresher` trait keeps that policy
//! swappable.

use std::sync::Arc;

use parking_lot::Mutex;
use pcce_lattice::{decrypt, encrypt, Ciphertext, CkksContext, PublicKey, SecretKey};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineResult;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshPolicy {
    /// Refresh operands transparently when a multiplication would exhaust
    /// the budget.
    #[default]
    Auto,
    /// Fail with `NoiseBudgetExceeded` instead.
    Disabled,
}

pub trait Refresher: Send + Sync {
    /// Returns a ciphertext with the same slots at the top level.
    fn refresh(&self, ct: &Ciphertext) -> EngineResult<Ciphertext>;
}

/// Refresh performed by the holder of the full secret key.
pub struct KeyHolderRefresher {
    ctx: Arc<CkksContext>,
    secret: Arc<SecretKey>,
    public: Arc<PublicKey>,
    rng: Mutex<ChaCha20Rng>,
}

impl KeyHolderRefresher {
    pub fn new(ctx: Arc<CkksContext>, secret: Arc<SecretKey>, public: Arc<PublicKey>) -> Self {
        Self {
            ctx,
            secret,
            public,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }
}

impl Refresher for KeyHolderRefresher {
    fn refresh(&self, ct: &Ciphertext) -> EngineResult<Ciphertext> {
        let slots = decrypt(&self.ctx, &self.secret, ct)?;
        let fresh = encrypt(&self.ctx, &self.public, &slots, &mut *self.rng.lock())?;
        debug!(from = ct.level(), to = fresh.level(), "ciphertext refreshed");
        Ok(fresh)
    }
}
