use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha512};

/// Fiat-Shamir transcript over SHA-512. Every message is length-prefixed and
/// labelled, and each challenge is folded back into the state.
#[derive(Clone)]
pub struct Transcript {
    state: Sha512,
}

impl Transcript {
    pub fn new(domain: &'static [u8]) -> Self {
        let mut t = Self {
            state: Sha512::new(),
        };
        t.append(b"domain", domain);
        t
    }

    pub fn append(&mut self, label: &'static [u8], message: &[u8]) {
        self.state.update((label.len() as u64).to_le_bytes());
        self.state.update(label);
        self.state.update((message.len() as u64).to_le_bytes());
        self.state.update(message);
    }

    pub fn append_point(&mut self, label: &'static [u8], point: &RistrettoPoint) {
        self.append(label, point.compress().as_bytes());
    }

    pub fn append_u64(&mut self, label: &'static [u8], value: u64) {
        self.append(label, &value.to_le_bytes());
    }

    pub fn challenge(&mut self, label: &'static [u8]) -> Scalar {
        self.append(b"challenge", label);
        let digest = self.state.clone().finalize();
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&digest);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        self.append(b"challenge-out", scalar.as_bytes());
        scalar
    }
}
