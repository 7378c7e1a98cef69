use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// One side of an x25519 key agreement.
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl std::fmt::Debug for EphemeralKeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyExchange")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

impl EphemeralKeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        EphemeralKeyExchange { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Consume the secret and agree on the shared secret with the peer.
    pub fn complete(self, peer_public: &[u8; 32]) -> Zeroizing<Vec<u8>> {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        Zeroizing::new(shared.as_bytes().to_vec())
    }
}
